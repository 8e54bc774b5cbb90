//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::BalancerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<BalancerConfig, ConfigError> {
    let config: BalancerConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BalancerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ProtocolKind, StrategyKind};
    use std::io::Write;

    #[test]
    fn loads_file_with_backends() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
address = "127.0.0.1"
port = 7000

[proxy]
protocol = "line"
strategy = "least_connections"

[[backends]]
address = "127.0.0.1:9001"
name = "alpha"

[[backends]]
address = "127.0.0.1:9002"
max_connections = 10
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.port, 7000);
        assert_eq!(config.proxy.protocol, ProtocolKind::Line);
        assert_eq!(config.proxy.strategy, StrategyKind::LeastConnections);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].name.as_deref(), Some("alpha"));
        assert_eq!(config.backends[1].max_connections, Some(10));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn syntax_error_is_parse_error() {
        assert!(matches!(
            parse_config("[listener\nport = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn semantic_errors_are_reported_together() {
        let err = parse_config(
            r#"
[proxy]
chunk_size = 0

[[backends]]
address = "nohost"
"#,
        )
        .unwrap_err();
        match &err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("Validation failed: "));
    }
}
