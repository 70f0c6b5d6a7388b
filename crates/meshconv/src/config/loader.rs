use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Parses, schema-checks and validates a config document, then applies
/// `MESHCONV_*` environment overrides.
pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let mut config: Config = serde_json::from_value(json_value)?;

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Built-in defaults plus environment overrides, for running without a file.
pub fn default_config() -> Result<Config, ConfigError> {
    let mut config = Config::default();
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(count) = env_override("MESHCONV_WORKER_COUNT")? {
        config.workers.worker_count = count;
    }
    if let Some(max) = env_override("MESHCONV_MAX_CONCURRENT")? {
        config.workers.max_concurrent = max;
    }
    if let Some(ttl) = env_override("MESHCONV_JOB_TTL_SECS")? {
        config.jobs.ttl_secs = ttl;
    }
    if let Some(level) = env_override::<String>("MESHCONV_LOG_LEVEL")? {
        config.logging.level = level.to_ascii_lowercase();
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.jobs.ttl_secs == 0 {
        return Err(invalid("jobs.ttl_secs must be at least 1"));
    }

    let queue = &config.queue;
    if queue.max_attempts == 0 {
        return Err(invalid("queue.max_attempts must be at least 1"));
    }
    if queue.backoff_base_ms > queue.backoff_cap_ms {
        return Err(invalid(format!(
            "queue.backoff_base_ms ({}) exceeds queue.backoff_cap_ms ({})",
            queue.backoff_base_ms, queue.backoff_cap_ms
        )));
    }

    let workers = &config.workers;
    if workers.worker_count == 0 {
        return Err(invalid("workers.worker_count must be at least 1"));
    }
    if workers.max_concurrent == 0 {
        return Err(invalid("workers.max_concurrent must be at least 1"));
    }
    if workers.store_write_attempts == 0 {
        return Err(invalid("workers.store_write_attempts must be at least 1"));
    }

    if config.converter.timeout_secs == 0 {
        return Err(invalid("converter.timeout_secs must be at least 1"));
    }
    if config.sweeper.interval_secs == 0 {
        return Err(invalid("sweeper.interval_secs must be at least 1"));
    }

    let validation = &config.validation;
    if !(validation.min_tolerance > 0.0) {
        return Err(invalid("validation.min_tolerance must be positive"));
    }
    if validation.min_tolerance > validation.max_tolerance {
        return Err(invalid(format!(
            "validation.min_tolerance ({}) exceeds validation.max_tolerance ({})",
            validation.min_tolerance, validation.max_tolerance
        )));
    }
    if !(validation.min_tolerance..=validation.max_tolerance)
        .contains(&validation.default_tolerance)
    {
        return Err(invalid(format!(
            "validation.default_tolerance ({}) is outside [{}, {}]",
            validation.default_tolerance, validation.min_tolerance, validation.max_tolerance
        )));
    }
    if validation.allowed_formats.is_empty() {
        return Err(invalid("validation.allowed_formats must not be empty"));
    }

    if config.polling.active_interval_ms == 0 || config.polling.backoff_interval_ms == 0 {
        return Err(invalid("polling intervals must be at least 1ms"));
    }

    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(invalid(format!(
            "Unknown log level '{}', expected one of {}",
            config.logging.level,
            LOG_LEVELS.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SourceFormat;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: [&str; 4] = [
        "MESHCONV_WORKER_COUNT",
        "MESHCONV_MAX_CONCURRENT",
        "MESHCONV_JOB_TTL_SECS",
        "MESHCONV_LOG_LEVEL",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_load_full_config() {
        clear_env();
        let json = r#"{
            "version": "1.0",
            "storage": { "data_dir": "/var/lib/meshconv" },
            "jobs": { "ttl_secs": 7200 },
            "queue": { "max_attempts": 5, "backoff_base_ms": 500, "backoff_cap_ms": 10000 },
            "workers": { "worker_count": 4, "max_concurrent": 1 },
            "converter": { "program": "/opt/freecad/bin/freecadcmd", "script": "/opt/meshconv/convert.py", "timeout_secs": 120 },
            "validation": { "allowed_formats": ["stl", "obj"] },
            "logging": { "level": "debug", "json": true }
        }"#;

        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.jobs.ttl_secs, 7200);
        assert_eq!(config.queue.retry_policy().max_attempts, 5);
        assert_eq!(config.workers.worker_count, 4);
        assert_eq!(config.workers.max_concurrent, 1);
        assert_eq!(config.converter.timeout_secs, 120);
        assert_eq!(
            config.validation.allowed_formats,
            vec![SourceFormat::Stl, SourceFormat::Obj]
        );
        assert!(config.logging.json);
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": "1.0", "jobs": {{"ttl_secs": 60}}}}"#).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.jobs.ttl_secs, 60);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    #[serial]
    fn test_schema_rejects_unknown_fields() {
        clear_env();
        let err = load_config_from_str(r#"{"version": "1.0", "bogus": true}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    #[serial]
    fn test_schema_rejects_zero_concurrency() {
        clear_env();
        let err =
            load_config_from_str(r#"{"workers": {"max_concurrent": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    #[serial]
    fn test_inverted_tolerance_range_rejected() {
        clear_env();
        let err = load_config_from_str(
            r#"{"validation": {"min_tolerance": 0.5, "max_tolerance": 0.1, "default_tolerance": 0.2}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    #[serial]
    fn test_backoff_base_above_cap_rejected() {
        clear_env();
        let err = load_config_from_str(
            r#"{"queue": {"backoff_base_ms": 5000, "backoff_cap_ms": 1000}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("MESHCONV_WORKER_COUNT", "8");
        std::env::set_var("MESHCONV_MAX_CONCURRENT", "3");
        std::env::set_var("MESHCONV_JOB_TTL_SECS", "120");
        std::env::set_var("MESHCONV_LOG_LEVEL", "WARN");

        let config = load_config_from_str("{}").unwrap();
        clear_env();

        assert_eq!(config.workers.worker_count, 8);
        assert_eq!(config.workers.max_concurrent, 3);
        assert_eq!(config.jobs.ttl_secs, 120);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        clear_env();
        std::env::set_var("MESHCONV_MAX_CONCURRENT", "lots");
        let err = default_config().unwrap_err();
        clear_env();

        assert!(matches!(err, ConfigError::InvalidEnv { ref name, .. } if name == "MESHCONV_MAX_CONCURRENT"));
    }

    #[test]
    #[serial]
    fn test_env_override_is_validated() {
        clear_env();
        std::env::set_var("MESHCONV_MAX_CONCURRENT", "0");
        let err = default_config().unwrap_err();
        clear_env();

        assert!(matches!(err, ConfigError::Validation { .. }));
    }
}
