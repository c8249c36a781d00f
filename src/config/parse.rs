use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::storage::FieldRef;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config from a YAML string
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    config.storage.path = expand_tilde(&config.storage.path);

    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let unexpanded = unexpanded_env_vars(yaml_string);
    if unexpanded.is_empty() {
        return Ok(());
    }

    let error_msg = if unexpanded.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_remote(&config.remote, &mut errors);
    validate_fetch(&config.fetch, &mut errors);

    if config.sources.is_empty() {
        errors.push("config must define at least one source under 'sources'".to_string());
    }

    for (source_id, source) in &config.sources {
        validate_source(source_id, source, &mut errors);
    }

    if let Some(clients) = &config.clients {
        if clients.leases_file.is_empty() {
            errors.push("clients.leases_file cannot be empty".to_string());
        }
    }

    for (name, summary) in &config.summaries {
        validate_summary(name, summary, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_remote(remote: &RemoteConfig, errors: &mut Vec<String>) {
    if remote.transport == Transport::Ssh {
        if remote.host.is_empty() {
            errors.push("remote.host is required for the ssh transport".to_string());
        }
        if remote.user.is_empty() {
            errors.push("remote.user is required for the ssh transport".to_string());
        }
    }

    if remote.command_timeout.is_zero() {
        errors.push("remote.command_timeout must be greater than zero".to_string());
    }
}

fn validate_fetch(fetch: &FetchSettings, errors: &mut Vec<String>) {
    if fetch.chunk_bytes == 0 {
        errors.push("fetch.chunk_bytes must be greater than zero".to_string());
    }
    if fetch.max_line_bytes == 0 {
        errors.push("fetch.max_line_bytes must be greater than zero".to_string());
    }
    if fetch.retry.max_attempts == 0 {
        errors.push("fetch.retry.max_attempts must be at least 1".to_string());
    }
    if fetch.retry.initial_backoff > fetch.retry.max_backoff {
        errors.push("fetch.retry.initial_backoff must not exceed fetch.retry.max_backoff".to_string());
    }
}

fn validate_source(source_id: &str, source: &SourceConfig, errors: &mut Vec<String>) {
    let prefix = format!("source '{}'", source_id);

    if source.remote_files.is_empty() {
        errors.push(format!("{}: remote_files must list at least one path", prefix));
    }
    if source.timestamp_field.is_empty() {
        errors.push(format!("{}: timestamp_field cannot be empty", prefix));
    }
    if source.destination.is_empty() {
        errors.push(format!("{}: destination cannot be empty", prefix));
    }

    // Per-file state is keyed by basename, so basenames must not collide
    let mut keys = HashSet::new();
    for (i, path) in source.remote_files.iter().enumerate() {
        if path.is_empty() {
            errors.push(format!("{}: remote_files[{}] cannot be empty", prefix, i));
            continue;
        }
        let key = crate::tail::file_key(path);
        if key.is_empty() {
            errors.push(format!(
                "{}: remote_files[{}] '{}' has no file name",
                prefix, i, path
            ));
        } else if !keys.insert(key.to_string()) {
            errors.push(format!(
                "{}: remote_files[{}] '{}' duplicates file name '{}'",
                prefix, i, path, key
            ));
        }
    }
}

fn validate_summary(name: &str, summary: &SummaryConfig, errors: &mut Vec<String>) {
    let prefix = format!("summary '{}'", name);

    if summary.destination.is_empty() {
        errors.push(format!("{}: destination cannot be empty", prefix));
    }
    if summary.group_by.is_empty() {
        errors.push(format!("{}: group_by must list at least one field", prefix));
    }
    for field in &summary.group_by {
        if let Err(e) = FieldRef::parse(field) {
            errors.push(format!("{}: {}", prefix, e));
        }
    }
    if let Some(field) = &summary.sum_field {
        match FieldRef::parse(field) {
            Ok(FieldRef::Path(_)) => {}
            Ok(_) => errors.push(format!(
                "{}: sum_field must be a plain field path, got '{}'",
                prefix, field
            )),
            Err(e) => errors.push(format!("{}: {}", prefix, e)),
        }
    }
}
