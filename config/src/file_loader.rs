//! # Configuration File Loading
//!
//! Loads configuration from TOML or YAML files.
//!
//! Supports automatic format detection based on file extension. Missing
//! sections take their defaults.

use crate::config::Config;
use std::path::Path;

/// Configuration file loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(String),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(String),

    #[error("Config file has no extension")]
    NoExtension,

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),
}

/// Load configuration from TOML file.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Loads complete configuration from a TOML format file.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_toml;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_toml(Path::new("config.toml"))?;
///     println!("Default model: {}", config.generation.default_model);
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// Returns `ConfigFileError` for:
/// - File not found
/// - Invalid TOML syntax
/// - Missing required fields
pub fn load_from_toml(path: &Path) -> Result<Config, ConfigFileError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|_e| ConfigFileError::FileNotFound(path.display().to_string()))?;

    let config: Config =
        toml::from_str(&contents).map_err(|e| ConfigFileError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Load configuration from YAML file.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Loads complete configuration from a YAML format file.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_yaml;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_yaml(Path::new("config.yaml"))?;
///     println!("Default model: {}", config.generation.default_model);
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// Returns `ConfigFileError` for:
/// - File not found
/// - Invalid YAML syntax
/// - Missing required fields
pub fn load_from_yaml(path: &Path) -> Result<Config, ConfigFileError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|_e| ConfigFileError::FileNotFound(path.display().to_string()))?;

    let config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigFileError::YamlParse(e.to_string()))?;

    Ok(config)
}

/// Load configuration from file with auto-detection.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Loads configuration from file, automatically detecting format from extension.
///
/// ## Supported Formats
/// - `.toml`: TOML format
/// - `.yaml`: YAML format
/// - `.yml`: YAML format
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_file;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_file(Path::new("config.yaml"))?;
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// Returns `ConfigFileError` for:
/// - File not found
/// - Invalid file extension
/// - Parse errors for detected format
pub fn load_from_file(path: &Path) -> Result<Config, ConfigFileError> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or(ConfigFileError::NoExtension)?;

    match extension.to_lowercase().as_str() {
        "toml" => load_from_toml(path),
        "yaml" | "yml" => load_from_yaml(path),
        other => Err(ConfigFileError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitAlgorithm;
    use std::fs;
    use tempfile::NamedTempFile;
    use validator::Validate;

    #[test]
    fn test_load_from_toml() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("toml");

        let toml_content = r#"
[redis]
url = "redis://redishost:6380"

[cache]
ttl_seconds = 600

[rate_limit]
algorithm = "sliding_window"

[rate_limit.per_model]
limit = 10
window_seconds = 30

[provider]
base_url = "http://localhost:8000/v1"
timeout_ms = 5000

[generation]
default_model = "local-8k"
fallback_model = ""
validate_theme = true

[[models.catalog]]
name = "local-8k"
context_window = 8000

[observability]
logging_level = "debug"
"#;
        fs::write(&path, toml_content).unwrap();

        let config = load_from_toml(&path).unwrap();
        assert_eq!(config.redis.url, "redis://redishost:6380");
        assert_eq!(config.cache.ttl_seconds, 600);
        assert_eq!(config.rate_limit.algorithm, RateLimitAlgorithm::SlidingWindow);
        assert_eq!(config.rate_limit.per_model.limit, 10);
        assert_eq!(config.provider.timeout_ms, 5000);
        assert!(config.generation.validate_theme);
        assert_eq!(config.model_catalog().context_window("local-8k"), Some(8000));
        assert_eq!(config.observability.logging_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("yaml");

        let yaml_content = r#"
redis:
  url: redis://redishost:6380
rate_limit:
  per_user:
    limit: 3
    window_seconds: 60
generation:
  default_model: gpt-4
models:
  catalog:
    - name: gpt-4
      context_window: 8192
observability:
  logging_level: warn
"#;
        fs::write(&path, yaml_content).unwrap();

        let config = load_from_yaml(&path).unwrap();
        assert_eq!(config.redis.url, "redis://redishost:6380");
        assert_eq!(config.rate_limit.per_user.limit, 3);
        assert_eq!(config.generation.default_model, "gpt-4");
        assert_eq!(config.models.catalog.len(), 1);
        assert_eq!(config.observability.logging_level, "warn");
    }

    #[test]
    fn test_load_from_file_unsupported() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("json");
        fs::write(&path, "{}").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_load_from_file_no_extension() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("");
        fs::write(&path, "").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::NoExtension)));
    }

    #[test]
    fn test_load_from_file_auto_detect_yaml() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("yml");
        fs::write(&path, "cache:\n  enabled: false\n").unwrap();

        let config = load_from_file(&path).unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl_seconds, 3600);
    }

    #[test]
    fn test_load_from_toml_invalid() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("toml");
        fs::write(&path, "[invalid\n").unwrap();

        let result = load_from_toml(&path);
        assert!(matches!(result, Err(ConfigFileError::TomlParse(_))));
    }

    #[test]
    fn test_load_from_yaml_invalid() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("yaml");
        fs::write(&path, "invalid: [unmatched\n").unwrap();

        let result = load_from_yaml(&path);
        assert!(matches!(result, Err(ConfigFileError::YamlParse(_))));
    }

    #[test]
    fn test_load_from_toml_not_found() {
        let path = Path::new("/nonexistent/path/config.toml");
        let result = load_from_toml(path);
        assert!(matches!(result, Err(ConfigFileError::FileNotFound(_))));
    }
}
