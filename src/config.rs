use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A STUN/TURN server handed to every peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long a caller waits in `calling` for an answer.
    pub answer_timeout_ms: u64,
    /// How long after `answered` the transport may take to connect.
    pub connect_timeout_ms: u64,
    /// Depth of each call actor's command queue.
    pub command_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            answer_timeout_ms: 45_000,
            connect_timeout_ms: 30_000,
            command_buffer: 32,
        }
    }
}

impl CallConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_json_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_carry_public_stun_servers() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.answer_timeout(), Duration::from_secs(45));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CallConfig::from_json_str(r#"{"answer_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.answer_timeout_ms, 500);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.ice_servers, CallConfig::default().ice_servers);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ice_servers": [{{"urls": ["turn:turn.example.org"], "username": "u", "credential": "p"}}]}}"#
        )
        .unwrap();

        let config = CallConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
    }
}
