//! bnd-lua: C++ declarations → Lua binding glue.
//!
//! Reads declaration files (one per native header), decides from comment
//! annotations which classes, free functions and enums get bindings, and
//! emits one self-contained C++ header per Lua state plus a `LuaSetup.hpp`
//! that dispatches on the state name.
//!
//! # Quick start
//!
//! Generate and write the headers from a config (suitable for `build.rs`):
//!
//! ```no_run
//! use std::path::Path;
//!
//! // Reads config TOML, ingests declarations, writes include/LuaBindings/...
//! bnd_lua::run(Path::new("bnd-lua.toml"), None).unwrap();
//! ```
//!
//! Or get the generated files without writing to disk:
//!
//! ```no_run
//! use std::path::Path;
//!
//! let files = bnd_lua::generate(Path::new("bnd-lua.toml")).unwrap();
//! for file in &files {
//!     println!("{}", file.path.display());
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

pub mod annotation;
pub mod callgen;
pub mod class_emit;
pub mod config;
pub mod decl;
pub mod emit;
pub mod error;
pub mod ingest;
pub mod model;
pub mod patch;
pub mod registry;
pub mod spelling;
pub mod types;

pub use emit::GeneratedFile;

/// Run the full pipeline: load config, ingest declarations, emit the
/// bindings, and write them under the output directory.
///
/// `config_path` is the path to a `bnd-lua.toml` configuration file.
/// `output` optionally overrides the output directory from the config.
///
/// Returns the directory the files were written under.
pub fn run(config_path: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let cfg = config::load_config(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let files = generate_from_config(&cfg, base_dir)?;

    let output_dir = match output {
        Some(p) => p.to_path_buf(),
        None => base_dir.join(&cfg.output.dir),
    };
    for file in &files {
        let path = output_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        std::fs::write(&path, &file.contents)
            .with_context(|| format!("writing output to {}", path.display()))?;

        info!(
            path = %path.display(),
            size = file.contents.len(),
            "wrote bindings"
        );
    }

    Ok(output_dir)
}

/// Parse a `bnd-lua.toml` config file, ingest the declaration files it
/// lists, and return the generated headers without writing to disk.
pub fn generate(config_path: &Path) -> Result<Vec<GeneratedFile>> {
    let cfg = config::load_config(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    generate_from_config(&cfg, base_dir)
}

/// Generate the headers from an already-loaded [`config::Config`].
///
/// `base_dir` is the directory relative to which declaration paths in the
/// config are resolved (typically the parent directory of the TOML file).
pub fn generate_from_config(cfg: &config::Config, base_dir: &Path) -> Result<Vec<GeneratedFile>> {
    info!(
        namespace = %cfg.output.namespace,
        declarations = cfg.declarations.len(),
        "loaded configuration"
    );

    let mut registry = registry::Registry::new(patch::from_config(&cfg.patches));
    registry
        .extra_includes
        .extend(cfg.extra_includes.iter().cloned());

    let mut stream = decl::DeclStream::new();
    for path in &cfg.declarations {
        stream.push_file(config::resolve_declaration(path, base_dir, &cfg.include_paths));
    }

    let summary = ingest::ingest(&stream, &mut registry).context("ingesting declarations")?;
    info!(
        classes = summary.classes,
        thin_classes = summary.thin_classes,
        functions = summary.functions,
        enums = summary.enums,
        skipped = summary.skipped,
        states = summary.states,
        "ingested declarations"
    );

    let files = emit::emit(&registry, &cfg.output.namespace).context("emitting bindings")?;

    info!(files = files.len(), "generated bindings");

    Ok(files)
}
