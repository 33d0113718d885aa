//! Integration tests for per-directory config discovery and merging.

use std::fs;
use std::path::{Path, PathBuf};

use simtest_core::{ConfigError, ConfigResolver, CONFIG_FILENAME};

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write file");
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().expect("canonicalize")
}

/// Test: fragments are concatenated root first, relative entries anchored
/// at their own file's directory.
#[test]
fn test_paths_merge_root_to_leaf() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = canonical(tmp.path());
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::create_dir_all(root.join("a/b/checks")).unwrap();

    write(&root.join(CONFIG_FILENAME), "python_paths: [lib]\n");
    write(&root.join("a/b").join(CONFIG_FILENAME), "search_paths:\n  - checks\n  - ../../lib\n");

    let resolved = ConfigResolver::new().resolve(&root.join("a/b")).expect("resolve");
    assert_eq!(
        resolved.dirs(),
        &[root.join("lib"), root.join("a/b/checks"), root.join("lib")],
        "duplicates are preserved, order is root to leaf"
    );
    assert_eq!(resolved.sources().len(), 2);
}

/// Test: a directory without any config resolves to an empty path.
#[test]
fn test_no_config_yields_empty_path() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let resolver = ConfigResolver::with_filename("never-present.yaml");
    let resolved = resolver.resolve(tmp.path()).expect("resolve");
    assert!(resolved.is_empty());
}

/// Test: unknown keys are rejected with file and line information.
#[test]
fn test_unknown_key_is_a_config_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = canonical(tmp.path());
    write(&root.join(CONFIG_FILENAME), "python_paths: []\nextra: 1\n");

    let err = ConfigResolver::new().resolve(&root).unwrap_err();
    match &err {
        ConfigError::Schema { path, line, .. } => {
            assert_eq!(path, &root.join(CONFIG_FILENAME));
            assert!(line.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(CONFIG_FILENAME));
}

/// Test: a non-list value is rejected.
#[test]
fn test_non_list_paths_is_a_config_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = canonical(tmp.path());
    write(&root.join(CONFIG_FILENAME), "python_paths: lib\n");
    assert!(matches!(
        ConfigResolver::new().resolve(&root),
        Err(ConfigError::Schema { .. })
    ));
}

/// Test: missing directories are kept (and only warned about).
#[test]
fn test_missing_directory_is_kept() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = canonical(tmp.path());
    write(&root.join(CONFIG_FILENAME), "python_paths: [does-not-exist]\n");

    let resolved = ConfigResolver::new().resolve(&root).expect("resolve");
    assert_eq!(resolved.dirs(), &[root.join("does-not-exist")]);
}

/// Test: discovery returns config files root first.
#[test]
fn test_discover_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = canonical(tmp.path());
    write(&root.join(CONFIG_FILENAME), "");
    write(&root.join("x").join(CONFIG_FILENAME), "");
    fs::create_dir_all(root.join("x/y")).unwrap();

    let files = ConfigResolver::new().discover(&root.join("x/y"));
    let ours: Vec<_> = files.into_iter().filter(|f| f.starts_with(&root)).collect();
    assert_eq!(ours, vec![root.join(CONFIG_FILENAME), root.join("x").join(CONFIG_FILENAME)]);
}
