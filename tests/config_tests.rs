use querytail::config::types::{DedupMode, Transport};
use querytail::config::{generate::generate_starter_config, load_config, ConfigError};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, yaml: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("config.yml");
    fs::write(&config_path, yaml).unwrap();
    config_path
}

#[test]
fn test_generated_config_is_valid() {
    std::env::set_var("ROUTER_SSH_HOST", "192.168.1.1");
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, &generate_starter_config());

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.remote.host, "192.168.1.1");
    assert_eq!(config.remote.transport, Transport::Ssh);
    assert_eq!(config.remote.ssh_options, vec!["ConnectTimeout=10".to_string()]);
    assert_eq!(config.fetch.retry.initial_backoff, Duration::from_millis(500));
    assert_eq!(config.fetch.dedup, DedupMode::Timestamp);

    assert_eq!(config.fetch.max_line_bytes, 1024 * 1024);
    assert_eq!(
        config.clients.as_ref().map(|c| c.leases_file.as_str()),
        Some("/var/lib/misc/dnsmasq.leases")
    );
    assert_eq!(config.summaries.len(), 3);
    assert_eq!(
        config.summaries["base-domain-summary"].group_by[0],
        "base_domain(QH)"
    );

    let querylog = &config.sources["querylog"];
    assert_eq!(querylog.timestamp_field, "T");
    assert_eq!(querylog.remote_files.len(), 2);
    assert!(!config.storage.path.to_string_lossy().starts_with('~'));
}

#[test]
fn test_full_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
remote:
  transport: ssh
  host: router.lan
  port: 2222
  user: root
  command_timeout: 45s
fetch:
  chunk_bytes: 65536
  retry:
    max_attempts: 5
    initial_backoff: 1s
    max_backoff: 30s
  dedup: timestamp_and_content
sources:
  querylog:
    description: DNS Query Log
    remote_files:
      - /opt/AdGuardHome/data/querylog.json
      - /opt/AdGuardHome/data/querylog.json.1
    timestamp_field: T
    destination: dns
storage:
  path: /var/lib/querytail/querytail.duckdb
web:
  listen: 127.0.0.1:9000
"#,
    );

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.remote.port, 2222);
    assert_eq!(config.remote.command_timeout, Duration::from_secs(45));
    assert_eq!(config.fetch.chunk_bytes, 65536);
    assert_eq!(config.fetch.retry.max_attempts, 5);
    assert_eq!(config.fetch.retry.max_backoff, Duration::from_secs(30));
    assert_eq!(config.fetch.dedup, DedupMode::TimestampAndContent);
    assert_eq!(config.sources["querylog"].destination, "dns");
    assert_eq!(config.web.listen, "127.0.0.1:9000");
}

#[test]
fn test_all_problems_reported_together() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
remote:
  host: router.lan
  user: root
fetch:
  chunk_bytes: 0
  retry:
    max_attempts: 0
sources:
  querylog:
    remote_files: []
    timestamp_field: ""
    destination: querylog
storage:
  path: /tmp/querytail.duckdb
"#,
    );

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 4, "{:?}", errors);
            assert!(errors.iter().any(|e| e.contains("chunk_bytes")));
            assert!(errors.iter().any(|e| e.contains("max_attempts")));
            assert!(errors.iter().any(|e| e.contains("remote_files")));
            assert!(errors.iter().any(|e| e.contains("timestamp_field")));
        }
        other => panic!("expected validation errors, got {:?}", other),
    }
}

#[test]
fn test_backoff_bounds_checked() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
remote:
  transport: local
fetch:
  retry:
    initial_backoff: 1m
    max_backoff: 10s
sources:
  querylog:
    remote_files: [/var/log/querylog.json]
    timestamp_field: T
    destination: querylog
storage:
  path: /tmp/querytail.duckdb
"#,
    );

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("initial_backoff"));
}

#[test]
fn test_no_sources_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
remote:
  transport: local
sources: {}
storage:
  path: /tmp/querytail.duckdb
"#,
    );

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("at least one source"));
}

#[test]
fn test_invalid_yaml_names_the_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "remote: [unclosed");

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("config.yml"));
}

#[test]
fn test_missing_file() {
    let err = load_config(std::path::Path::new("/nonexistent/querytail.yml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
