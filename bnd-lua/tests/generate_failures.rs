//! Configurations that abort generation, and declarations that are dropped
//! with a warning instead.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bnd_lua::GeneratedFile;

fn fixture(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../tests/fixtures").join(path)
}

static CYCLE: LazyLock<Result<Vec<GeneratedFile>, String>> =
    LazyLock::new(|| bnd_lua::generate(&fixture("cycle/cycle.toml")).map_err(|e| format!("{e:#}")));

static MISSING: LazyLock<Result<Vec<GeneratedFile>, String>> = LazyLock::new(|| {
    bnd_lua::generate(&fixture("missing/missing.toml")).map_err(|e| format!("{e:#}"))
});

static DUPLICATE: LazyLock<Vec<GeneratedFile>> = LazyLock::new(|| {
    bnd_lua::generate(&fixture("duplicate/duplicate.toml")).expect("generate duplicate bindings")
});

#[test]
fn extra_base_closing_a_cycle_aborts() {
    let err = CYCLE.as_ref().expect_err("cycle should abort");
    assert!(
        err.contains("base cycle: '::Loop::A' cannot derive from '::Loop::B'"),
        "unexpected error, got:\n{err}"
    );
    assert!(err.starts_with("ingesting declarations"), "got:\n{err}");
}

#[test]
fn missing_declaration_file_aborts() {
    let err = MISSING.as_ref().expect_err("missing file should abort");
    assert!(
        err.contains("failed to read declaration file"),
        "unexpected error, got:\n{err}"
    );
    assert!(err.contains("does_not_exist.toml"), "got:\n{err}");
}

#[test]
fn first_definition_of_a_duplicate_class_wins() {
    let main = DUPLICATE
        .iter()
        .find(|f| f.path == Path::new("include/LuaBindings/States/Main/Main.hpp"))
        .expect("Main state file");
    let text = &main.contents;
    assert!(text.contains("#include \"first/thing.hpp\"\n"));
    assert!(!text.contains("second/thing.hpp"));
    assert!(text.contains("__Dup_Thing_member_function_wrapper_FromFirst"));
    assert!(!text.contains("FromSecond"));
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bnd-lua.toml");
    std::fs::write(&config, "declarations = [\n").unwrap();
    let err = format!("{:#}", bnd_lua::generate(&config).unwrap_err());
    assert!(err.contains("loading config from"), "got:\n{err}");
    assert!(err.contains("failed to parse config file"), "got:\n{err}");
}
