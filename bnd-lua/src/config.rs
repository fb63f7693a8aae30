//! Configuration types for `bnd-lua.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    /// Declaration files, one per native header. Relative paths are
    /// resolved against the TOML file's directory first, then each
    /// `include_paths` entry.
    #[serde(default)]
    pub declarations: Vec<PathBuf>,
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Headers added to every generated state file.
    #[serde(default)]
    pub extra_includes: Vec<String>,
    #[serde(default)]
    pub patches: PatchesConfig,
}

/// Output settings.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Directory the `include/LuaBindings/...` tree is written under.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// C++ namespace wrapping every generated file.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            namespace: default_namespace(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("generated")
}

fn default_namespace() -> String {
    "RC::LuaBindings".to_string()
}

/// Optional type patches. A patch is active when its table is present.
#[derive(Debug, Default, Deserialize)]
pub struct PatchesConfig {
    pub dynamic_array: Option<DynamicArrayConfig>,
    pub heap_objects: Option<HeapObjectConfig>,
}

/// A container template exposed through a wrapper struct.
///
/// ```toml
/// [patches.dynamic_array]
/// template = "::RC::Unreal::TArray"
/// wrapper = "::RC::UnrealRuntimeTypes::ArrayTest"
/// raw = "::RC::Unreal::FScriptArray"
/// include = "UnrealRuntimeTypes/Array.hpp"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicArrayConfig {
    /// Qualified template name as it appears in declarations.
    pub template: String,
    /// Qualified wrapper struct that Lua sees.
    pub wrapper: String,
    /// Qualified type-erased array the wrapper points at.
    pub raw: String,
    #[serde(default)]
    pub include: Option<String>,
}

/// Short type names per class plus heap pushers for every bound type.
#[derive(Debug, Clone, Deserialize)]
pub struct HeapObjectConfig {
    /// Prefixes removed from class names to form the short name.
    #[serde(default)]
    pub strip_prefixes: Vec<String>,
    /// Metatable field holding the short name.
    #[serde(default = "default_name_field")]
    pub name_field: String,
}

fn default_name_field() -> String {
    "__short_name".to_string()
}

/// Where a `declarations` entry lives: next to the config file, else under
/// the first `include_paths` directory holding it. A declaration found
/// nowhere resolves next to the config, and reading it then fails with that
/// path in the message.
pub fn resolve_declaration(path: &Path, base_dir: &Path, include_paths: &[PathBuf]) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let candidate = base_dir.join(path);
    if candidate.exists() {
        return candidate;
    }
    for inc in include_paths {
        let candidate = base_dir.join(inc).join(path);
        if candidate.exists() {
            return candidate;
        }
    }
    base_dir.join(path)
}

/// Reads a `bnd-lua.toml`. Keys missing from the file take their defaults.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config: Config = toml::from_str("declarations = [\"a.toml\"]").unwrap();
        assert_eq!(config.output.dir, PathBuf::from("generated"));
        assert_eq!(config.output.namespace, "RC::LuaBindings");
        assert_eq!(config.declarations, vec![PathBuf::from("a.toml")]);
        assert!(config.patches.dynamic_array.is_none());
        assert!(config.patches.heap_objects.is_none());
    }

    #[test]
    fn patch_tables_enable_patches() {
        let config: Config = toml::from_str(
            r#"
            [output]
            namespace = "Game::Lua"

            [patches.heap_objects]
            strip_prefixes = ["F", "U"]

            [patches.dynamic_array]
            template = "::Engine::TArray"
            wrapper = "::Engine::Runtime::ArrayWrapper"
            raw = "::Engine::FScriptArray"
            "#,
        )
        .unwrap();
        assert_eq!(config.output.namespace, "Game::Lua");
        assert_eq!(config.output.dir, PathBuf::from("generated"));
        let heap = config.patches.heap_objects.unwrap();
        assert_eq!(heap.strip_prefixes, vec!["F", "U"]);
        assert_eq!(heap.name_field, "__short_name");
        let array = config.patches.dynamic_array.unwrap();
        assert_eq!(array.wrapper, "::Engine::Runtime::ArrayWrapper");
        assert!(array.include.is_none());
    }

    #[test]
    fn declarations_fall_back_to_include_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("decls")).unwrap();
        std::fs::write(dir.path().join("decls/world.toml"), "source = \"world.hpp\"\n").unwrap();

        let include_paths = [PathBuf::from("decls")];
        assert_eq!(
            resolve_declaration(Path::new("world.toml"), dir.path(), &include_paths),
            dir.path().join("decls/world.toml")
        );
        assert_eq!(
            resolve_declaration(Path::new("gone.toml"), dir.path(), &include_paths),
            dir.path().join("gone.toml")
        );
    }

    #[test]
    fn unreadable_config_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bnd-lua.toml");
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.starts_with("failed to read config file "), "{err}");
        assert!(err.contains("bnd-lua.toml"), "{err}");
    }
}
