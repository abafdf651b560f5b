//! Configuration loading and precedence tests

use cplug_config::{ConfigError, ConfigLoader, GlobalConfig};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn create_config_file(dir: &Path, content: &str) -> PathBuf {
    let config_path = dir.join("cplug.toml");
    fs::write(&config_path, content).unwrap();
    config_path
}

fn create_global_file(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("global.toml");
    fs::write(&path, content).unwrap();
    path
}

struct EnvGuard(&'static [&'static str]);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.0 {
            env::remove_var(key);
        }
    }
}

// ============================================================================
// Config Loading Tests
// ============================================================================

#[test]
#[serial]
fn test_load_when_no_config_exists() {
    let temp_dir = TempDir::new().unwrap();

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(!config.is_project());
    assert_eq!(config.open_mode(), vec!["now".to_string()]);
}

#[test]
#[serial]
fn test_load_with_empty_config() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "");

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(config.is_project());
    assert_eq!(config.log_level(), "info");
}

#[test]
#[serial]
fn test_load_from_subdirectory_finds_parent() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        r#"
[logging]
level = "debug"
"#,
    );

    let nested = temp_dir.path().join("a").join("b");
    fs::create_dir_all(&nested).unwrap();

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    let config = loader.load_from_directory(&nested).unwrap();

    assert_eq!(config.log_level(), "debug");
    assert_eq!(config.project_root(), Some(temp_dir.path()));
}

#[test]
#[serial]
fn test_invalid_toml_reports_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(temp_dir.path(), "[loader\nmode = ");

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    match loader.load_from_file(&path) {
        Err(ConfigError::TomlParseError { file, .. }) => assert_eq!(file, path),
        other => panic!("expected parse error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_invalid_open_mode_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(
        temp_dir.path(),
        r#"
[loader]
mode = ["lazy", "now"]
"#,
    );

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    assert!(matches!(
        loader.load_from_file(&path),
        Err(ConfigError::InvalidValue { .. })
    ));
}

#[test]
fn test_missing_global_file_is_not_found() {
    let result = GlobalConfig::load_from_file(Path::new("/no/such/cplug/config.toml"));
    assert!(matches!(result, Err(ConfigError::NotFound(_))));
}

// ============================================================================
// Precedence Tests
// ============================================================================

#[test]
#[serial]
fn test_project_overrides_global() {
    let temp_dir = TempDir::new().unwrap();
    let global = create_global_file(
        temp_dir.path(),
        r#"
[loader]
mode = ["lazy"]

[logging]
level = "warn"
format = "json"
"#,
    );
    create_config_file(
        temp_dir.path(),
        r#"
[logging]
level = "trace"
"#,
    );

    let mut loader = ConfigLoader::with_global_config_path(global);
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    // project value wins, global fills the gaps
    assert_eq!(config.log_level(), "trace");
    assert_eq!(config.log_format(), "json");
    assert_eq!(config.open_mode(), vec!["lazy".to_string()]);
}

#[test]
#[serial]
fn test_env_overrides_project() {
    let _guard = EnvGuard(&["CPLUG_OPEN_MODE", "CPLUG_LOG", "CPLUG_LIBRARY_PATH"]);
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        r#"
[loader]
search_paths = ["native"]
mode = ["lazy"]

[logging]
filter = "cplug_runtime=info"
"#,
    );

    env::set_var("CPLUG_OPEN_MODE", "now,global");
    env::set_var("CPLUG_LOG", "cplug_runtime=trace");
    env::set_var(
        "CPLUG_LIBRARY_PATH",
        env::join_paths(["/env/first", "/env/second"]).unwrap(),
    );

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert_eq!(
        config.open_mode(),
        vec!["now".to_string(), "global".to_string()]
    );
    assert_eq!(config.log_filter(), Some("cplug_runtime=trace"));
    assert_eq!(
        config.search_paths(),
        vec![
            PathBuf::from("/env/first"),
            PathBuf::from("/env/second"),
            temp_dir.path().join("native"),
        ]
    );
}

#[test]
#[serial]
fn test_search_path_order_env_project_global() {
    let _guard = EnvGuard(&["CPLUG_LIBRARY_PATH"]);
    let temp_dir = TempDir::new().unwrap();
    let global = create_global_file(
        temp_dir.path(),
        r#"
[loader]
search_paths = ["/global/lib"]
"#,
    );
    create_config_file(
        temp_dir.path(),
        r#"
[loader]
search_paths = ["/project/lib"]
"#,
    );
    env::set_var("CPLUG_LIBRARY_PATH", "/env/lib");

    let mut loader = ConfigLoader::with_global_config_path(global);
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert_eq!(
        config.search_paths(),
        vec![
            PathBuf::from("/env/lib"),
            PathBuf::from("/project/lib"),
            PathBuf::from("/global/lib"),
        ]
    );
}

#[test]
#[serial]
fn test_merged_logging_section() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        r#"
[logging]
format = "compact"
"#,
    );

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("none.toml"));
    let logging = loader
        .load_from_directory(temp_dir.path())
        .unwrap()
        .logging();

    assert_eq!(logging.level.as_deref(), Some("info"));
    assert_eq!(logging.format.as_deref(), Some("compact"));
    assert_eq!(logging.filter, None);
}
