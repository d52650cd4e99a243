//! Agent configuration.
//!
//! Loaded by the host app from its bundled configuration (JSON) and consumed
//! read-only by the agent. Every field has a default, so an empty document is
//! a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Header that carries the token on outgoing requests.
pub const DEFAULT_TOKEN_HEADER: &str = "ApproovToken";

/// Name of the scripting object injected into registered web content.
pub const DEFAULT_BRIDGE_OBJECT: &str = "approov";

/// Prefix of the token segment appended to `User-Agent`.
pub const USER_AGENT_TOKEN_KEY: &str = "Approov";

/// Environment override for [`AgentConfig::append_token_header`].
pub const APPEND_HEADER_ENV: &str = "ATTESTEE_APPEND_TOKEN_HEADER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Where the token goes on an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPlacement {
    /// Dedicated header named by `token_header`
    #[default]
    Dedicated,
    /// ` Approov/<token>` segment on the `User-Agent` header
    UserAgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Process-wide default for automatic header augmentation
    pub append_token_header: bool,
    /// Header key used with [`HeaderPlacement::Dedicated`]
    pub token_header: String,
    pub header_placement: HeaderPlacement,
    /// Scripting object name visible to page code
    pub bridge_object_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            append_token_header: false,
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            header_placement: HeaderPlacement::Dedicated,
            bridge_object_name: DEFAULT_BRIDGE_OBJECT.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply environment overrides on top of this configuration.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(APPEND_HEADER_ENV) {
            self.append_token_header = parse_flag(APPEND_HEADER_ENV, &raw)?;
        }
        Ok(self)
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert!(!config.append_token_header);
        assert_eq!(config.token_header, "ApproovToken");
        assert_eq!(config.header_placement, HeaderPlacement::Dedicated);
        assert_eq!(config.bridge_object_name, "approov");
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(AgentConfig::from_json_str("{}").unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = AgentConfig::from_json_str(
            r#"{"append_token_header": true, "header_placement": "user_agent"}"#,
        )
        .unwrap();
        assert!(config.append_token_header);
        assert_eq!(config.header_placement, HeaderPlacement::UserAgent);
        assert_eq!(config.token_header, DEFAULT_TOKEN_HEADER);
    }

    #[test]
    fn test_malformed_document() {
        let result = AgentConfig::from_json_str(r#"{"append_token_header": "maybe"}"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_override() {
        let config = AgentConfig::default()
            .with_overrides_from(|key| (key == APPEND_HEADER_ENV).then(|| "yes".to_string()))
            .unwrap();
        assert!(config.append_token_header);

        let result = AgentConfig::default().with_overrides_from(|_| Some("sometimes".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AgentConfig::load(Path::new("/nonexistent/attestee.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
