use crate::probe::DelayPolicy;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables shared by every handler.
///
/// ```toml
/// probing_enabled = true
/// stabilization_attempts = 3
///
/// [delay]
/// strategy = "exponential"
/// base_seconds = 10
/// max_seconds = 120
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// When false, stabilization waits are skipped entirely.
    pub probing_enabled: bool,
    pub stabilization_attempts: u32,
    pub delay: DelayPolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            probing_enabled: true,
            stabilization_attempts: 3,
            delay: DelayPolicy::default(),
        }
    }
}

impl HandlerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        toml::from_str(input).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::BackoffStrategy;

    #[test]
    fn empty_document_is_default() {
        let config = HandlerConfig::from_toml_str("").unwrap();
        assert_eq!(config, HandlerConfig::default());
        assert!(config.probing_enabled);
        assert_eq!(config.stabilization_attempts, 3);
        assert_eq!(config.delay.delay_seconds(1), 30);
    }

    #[test]
    fn parses_delay_table() {
        let config = HandlerConfig::from_toml_str(
            r#"
probing_enabled = false
stabilization_attempts = 10

[delay]
strategy = "exponential"
base_seconds = 10
max_seconds = 120
"#,
        )
        .unwrap();
        assert!(!config.probing_enabled);
        assert_eq!(config.stabilization_attempts, 10);
        assert_eq!(config.delay.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.delay.delay_seconds(5), 120);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(HandlerConfig::from_toml_str("probing = true").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handler.toml");
        std::fs::write(&path, "stabilization_attempts = 7\n").unwrap();
        let config = HandlerConfig::load(&path).unwrap();
        assert_eq!(config.stabilization_attempts, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = HandlerConfig::load(Path::new("/nonexistent/handler.toml")).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
