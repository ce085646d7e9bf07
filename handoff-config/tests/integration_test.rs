//! Integration tests for handoff-config

use handoff_config::*;
use std::io::Write;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = HandoffConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("HANDOFF_READ_BUFFER_SIZE", Some("4096")),
        ("HANDOFF_MAX_FRAME_LEN", Some("1024")),
        ("HANDOFF_MAX_FDS_PER_MESSAGE", Some("2")),
        ("HANDOFF_LOG_LEVEL", Some("debug")),
        ("HANDOFF_LOG_FORMAT", Some("json")),
    ];

    with_vars(vars, || {
        let loader = ConfigLoader::new();
        let config = loader.from_env().unwrap();

        assert_eq!(config.event_loop.read_buffer_size, 4096);
        assert_eq!(config.ipc.max_frame_len, 1024);
        assert_eq!(config.ipc.max_fds_per_message, 2);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    });
}

#[test]
fn test_invalid_env_value_is_rejected() {
    with_vars(vec![("HANDOFF_MAX_FRAME_LEN", Some("lots"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
        assert!(err.to_string().contains("MAX_FRAME_LEN"));
    });
}

#[test]
fn test_env_override_is_validated() {
    with_vars(vec![("HANDOFF_READ_BUFFER_SIZE", Some("0"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("PEER_LOG_LEVEL", Some("trace"))], || {
        let config = ConfigLoader::with_prefix("PEER").from_env().unwrap();
        assert_eq!(config.logging.level, LogLevel::Trace);
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = HandoffConfig::generate_sample();
    let parsed: HandoffConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
}

#[test]
fn test_load_from_file_with_partial_domains() {
    let yaml = r#"
event_loop:
  read_buffer_size: 8192

ipc:
  max_fds_per_message: 4

logging:
  level: warn
  format: compact
  directives:
    - "handoff_runtime=debug"
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    with_vars(vec![("HANDOFF_LOG_LEVEL", None::<&str>)], || {
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();

        assert_eq!(config.event_loop.read_buffer_size, 8192);
        // Unspecified fields fall back to defaults
        assert_eq!(config.event_loop.max_accepts_per_tick, 128);
        assert_eq!(config.ipc.max_fds_per_message, 4);
        assert_eq!(config.ipc.max_frame_len, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.logging.filter_string(), "warn,handoff_runtime=debug");
    });
}

#[test]
fn test_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigLoader::new()
        .from_file(dir.path().join("missing.yaml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::FileReadError(_)));
}
