//! Connection configuration.
//!
//! Every limit and deadline is caller-configurable; the defaults below are
//! policy, not protocol. Configs deserialize from TOML with any field
//! omitted falling back to its default:
//!
//! ```toml
//! max_message_size = 1048576
//! ping_timeout_ms = 5000
//! subprotocols = ["chat.v2", "chat"]
//!
//! [headers]
//! Origin = "https://example.com"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WsConfig {
    /// Largest payload accepted in a single inbound frame.
    pub max_frame_size: u64,
    /// Largest reassembled inbound message; exceeding it closes with 1009.
    pub max_message_size: usize,
    /// Outbound messages longer than this are split into fragments. 0 disables.
    pub fragment_threshold: usize,
    pub handshake_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Size of the scratch buffer handed to each transport read.
    pub read_buffer_size: usize,
    /// Upper bound on the HTTP response head during the handshake.
    pub max_handshake_response: usize,
    pub subprotocols: Vec<String>,
    /// Offered verbatim in `Sec-WebSocket-Extensions`; never activated.
    pub extensions: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            fragment_threshold: 1024 * 1024,
            handshake_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            ping_timeout_ms: 10_000,
            read_buffer_size: 8 * 1024,
            max_handshake_response: 16 * 1024,
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl WsConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: WsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_frame_size", self.max_frame_size == 0),
            ("max_message_size", self.max_message_size == 0),
            ("read_buffer_size", self.read_buffer_size == 0),
            ("max_handshake_response", self.max_handshake_response == 0),
            ("handshake_timeout_ms", self.handshake_timeout_ms == 0),
            ("close_timeout_ms", self.close_timeout_ms == 0),
            ("ping_timeout_ms", self.ping_timeout_ms == 0),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }
        if self.fragment_threshold as u64 > self.max_frame_size {
            return Err(ConfigError::Invalid(format!(
                "fragment_threshold {} exceeds max_frame_size {}",
                self.fragment_threshold, self.max_frame_size
            )));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Extra request headers in a stable order.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        WsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WsConfig::from_toml_str(
            r#"
            ping_timeout_ms = 250
            subprotocols = ["chat"]

            [headers]
            Origin = "https://example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.ping_timeout(), Duration::from_millis(250));
        assert_eq!(config.subprotocols, vec!["chat".to_string()]);
        assert_eq!(
            config.header_pairs(),
            vec![("Origin".to_string(), "https://example.com".to_string())]
        );
        assert_eq!(config.max_frame_size, WsConfig::default().max_frame_size);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = WsConfig::from_toml_str("max_frame_sise = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "got: {}", err);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = WsConfig::from_toml_str("max_message_size = 0").unwrap_err();
        assert!(err.to_string().contains("max_message_size"), "got: {}", err);
    }

    #[test]
    fn test_fragment_threshold_bounded_by_frame_size() {
        let err = WsConfig::from_toml_str("max_frame_size = 100\nfragment_threshold = 200")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.toml");
        std::fs::write(&path, "close_timeout_ms = 1500\n").unwrap();
        let config = WsConfig::load(&path).unwrap();
        assert_eq!(config.close_timeout(), Duration::from_millis(1500));

        let missing = WsConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
