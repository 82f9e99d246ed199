use godap_config::{ConfigError, GodapConfig};
use pretty_assertions::assert_eq;
use std::{path::PathBuf, time::Duration};

#[test]
fn loads_logging_and_adapter_sections_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("godap.toml");
    std::fs::write(
        &path,
        r#"
[logging]
level = "godap.session=debug,info"
json = true
stderr = false
file = "/tmp/godap.log"

[adapter]
dlv_path = "/usr/local/bin/dlv"
disconnect_timeout_ms = 2000
stack_trace_depth = 20
"#,
    )
    .unwrap();

    let config = GodapConfig::load_from_path(&path).unwrap();
    assert_eq!(config.logging.level, "godap.session=debug,info");
    assert!(config.logging.json);
    assert!(!config.logging.stderr);
    assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/godap.log")));
    assert_eq!(config.adapter.disconnect_timeout(), Duration::from_secs(2));
    assert_eq!(config.adapter.stack_trace_depth, 20);
    assert_eq!(config.adapter.halt_timeout(), Duration::from_secs(1));
}

#[test]
fn missing_file_is_an_io_error_naming_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = GodapConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn unknown_adapter_key_is_rejected() {
    let err = GodapConfig::load_from_str_with_diagnostics(
        r#"
[adapter]
halt_timeout = 5
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("halt_timeout"), "{err}");
}

#[test]
fn explicit_path_wins_over_environment() {
    let explicit = PathBuf::from("/etc/godap.toml");
    assert_eq!(
        GodapConfig::resolve_path(Some(explicit.clone())),
        Some(explicit)
    );
}
