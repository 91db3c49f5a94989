//! Session configuration.
//!
//! Every section deserializes from TOML with defaults for missing keys:
//!
//! ```toml
//! [transport]
//! server_url = "wss://collab.example.com"
//! max_backoff_ms = 15000
//!
//! [persistence]
//! edit_threshold = 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::awareness::DEFAULT_PALETTE;
use crate::error::CollabError;

/// Causal buffer limits for the replica store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Maximum operations held while waiting for dependencies
    pub max_pending: usize,
    /// How long the oldest pending op may wait before a resync is requested
    pub stall_timeout_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_pending: 512,
            stall_timeout_ms: 5_000,
        }
    }
}

impl ReplicaConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Connection, retry and heartbeat settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay base URL; the room token is appended as a path segment
    pub server_url: String,
    /// Per-attempt handshake timeout
    pub connect_timeout_ms: u64,
    /// First reconnect delay
    pub initial_backoff_ms: u64,
    /// Reconnect delay ceiling
    pub max_backoff_ms: u64,
    /// Give up after this many consecutive failures (None = never)
    pub max_retries: Option<u32>,
    /// Ping interval while connected
    pub heartbeat_interval_ms: u64,
    /// Declare the link lost after this long without inbound frames
    pub idle_timeout_ms: u64,
    /// Operations kept for replay while offline
    pub offline_queue_size: usize,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout_ms: 5_000,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            max_retries: None,
            heartbeat_interval_ms: 10_000,
            idle_timeout_ms: 30_000,
            offline_queue_size: 10_000,
            event_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Presence liveness and color palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Remove a peer after this long without an update
    pub liveness_timeout_ms: u64,
    /// Re-broadcast the local state this often
    pub heartbeat_interval_ms: u64,
    /// `#rrggbb` colors handed out to sessions
    pub palette: Vec<String>,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl AwarenessConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Save cadence and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Save a dirty document at least this often
    pub save_interval_ms: u64,
    /// Save once this many edits accumulate
    pub edit_threshold: u32,
    /// Per-attempt timeout for load and save
    pub save_timeout_ms: u64,
    /// Attempts before a save is reported as failed
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 30_000,
            edit_threshold: 50,
            save_timeout_ms: 10_000,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl PersistenceConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}

/// Share link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Base URL of the hosted editor page
    pub base_url: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/collab".to_string(),
        }
    }
}

/// Complete configuration for an editor session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub replica: ReplicaConfig,
    pub transport: TransportConfig,
    pub awareness: AwarenessConfig,
    pub persistence: PersistenceConfig,
    pub share: ShareConfig,
}

impl CollabConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            replica: ReplicaConfig {
                max_pending: 64,
                stall_timeout_ms: 500,
            },
            transport: TransportConfig {
                connect_timeout_ms: 500,
                initial_backoff_ms: 10,
                max_backoff_ms: 100,
                heartbeat_interval_ms: 50,
                idle_timeout_ms: 2_000,
                offline_queue_size: 1_000,
                ..TransportConfig::default()
            },
            awareness: AwarenessConfig {
                liveness_timeout_ms: 300,
                heartbeat_interval_ms: 50,
                ..AwarenessConfig::default()
            },
            persistence: PersistenceConfig {
                save_interval_ms: 200,
                edit_threshold: 5,
                save_timeout_ms: 200,
                max_attempts: 3,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
            },
            share: ShareConfig::default(),
        }
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, CollabError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that would stall the session loop.
    pub fn validate(&self) -> Result<(), CollabError> {
        let fail = |msg: &str| Err(CollabError::Config(msg.to_string()));

        if self.replica.max_pending == 0 {
            return fail("replica.max_pending must be at least 1");
        }
        let server = url::Url::parse(&self.transport.server_url).ok();
        if !server.is_some_and(|u| matches!(u.scheme(), "ws" | "wss")) {
            return fail("transport.server_url must be a ws:// or wss:// URL");
        }
        if self.transport.initial_backoff_ms == 0
            || self.transport.initial_backoff_ms > self.transport.max_backoff_ms
        {
            return fail("transport backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms");
        }
        if self.transport.heartbeat_interval_ms == 0
            || self.transport.heartbeat_interval_ms >= self.transport.idle_timeout_ms
        {
            return fail("transport.heartbeat_interval_ms must be below idle_timeout_ms");
        }
        if self.awareness.heartbeat_interval_ms == 0
            || self.awareness.heartbeat_interval_ms >= self.awareness.liveness_timeout_ms
        {
            return fail("awareness.heartbeat_interval_ms must be below liveness_timeout_ms");
        }
        if self.awareness.palette.is_empty() {
            return fail("awareness.palette cannot be empty");
        }
        if let Some(bad) = self.awareness.palette.iter().find(|c| !is_hex_color(c)) {
            return Err(CollabError::Config(format!(
                "awareness.palette entry {bad:?} is not a #rrggbb color"
            )));
        }
        if let Err(e) = crate::share::parse_base(&self.share.base_url) {
            return Err(CollabError::Config(format!("share.base_url: {e}")));
        }
        if self.persistence.max_attempts == 0 {
            return fail("persistence.max_attempts must be at least 1");
        }
        if self.persistence.initial_backoff_ms > self.persistence.max_backoff_ms {
            return fail("persistence.initial_backoff_ms exceeds max_backoff_ms");
        }
        Ok(())
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        CollabConfig::default().validate().unwrap();
        CollabConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CollabConfig::from_toml_str(
            r#"
            [transport]
            server_url = "wss://collab.example.com"
            max_backoff_ms = 15000

            [persistence]
            edit_threshold = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.server_url, "wss://collab.example.com");
        assert_eq!(config.transport.max_backoff_ms, 15_000);
        assert_eq!(config.transport.initial_backoff_ms, 250);
        assert_eq!(config.persistence.edit_threshold, 20);
        assert_eq!(config.replica, ReplicaConfig::default());
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = CollabConfig::from_toml_str("[transport]\nserver_url = \"http://x\"\n");
        assert!(matches!(err, Err(CollabError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_palette() {
        let mut config = CollabConfig::default();
        config.awareness.palette = vec!["#12345".into()];
        assert!(config.validate().is_err());

        config.awareness.palette.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = CollabConfig::default();
        config.transport.initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collab.toml");
        std::fs::write(&path, "[awareness]\nliveness_timeout_ms = 45000\n").unwrap();

        let config = CollabConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.awareness.liveness_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = CollabConfig::from_toml_file("/nonexistent/collab.toml");
        assert!(matches!(err, Err(CollabError::Config(_))));
    }
}
