use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::peer::types::{IceServerKind, ServerConfig};
use crate::relay::parse_relay_url;

/// Default log level: verbose in debug builds, quieter in release.
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    /// Seconds an unanswered call may ring; 0 disables the timeout.
    pub ring_timeout_secs: u64,
    pub toast_ttl_ms: u64,
    /// Send an explicit `hang-up` frame when ending a call.
    pub send_hangup: bool,
    pub reconnect: ReconnectPolicy,
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".into(),
            ice_servers: default_ice_servers(),
            ring_timeout_secs: 45,
            toast_ttl_ms: 5000,
            send_hangup: false,
            reconnect: ReconnectPolicy::default(),
            logging: LogConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.into(),
            json: false,
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(data).context("parse config json")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        parse_relay_url(&self.relay_url).context("relay_url")?;
        for server in &self.ice_servers {
            if server.url.is_empty() {
                anyhow::bail!("ice server {}: url cannot be empty", server.id);
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                anyhow::bail!("ice server {}: TURN requires username and credential", server.id);
            }
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!("reconnect: initial_delay_ms exceeds max_delay_ms");
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    pub fn toast_ttl(&self) -> Duration {
        Duration::from_millis(self.toast_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_config_from_json_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("config.json");
        fs::write(
            &cfg_path,
            r#"{
                "relay_url": "wss://relay.example.com",
                "ring_timeout_secs": 20,
                "send_hangup": true
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.relay_url, "wss://relay.example.com");
        assert_eq!(cfg.ring_timeout(), Some(Duration::from_secs(20)));
        assert!(cfg.send_hangup);
        assert_eq!(cfg.toast_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn reject_http_relay_url() {
        let err = Config::from_json_str(r#"{"relay_url": "https://relay.example.com"}"#)
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("relay_url"));
        assert!(chain.contains("unsupported scheme https"));
    }

    #[test]
    fn reject_turn_without_credentials() {
        let err = Config::from_json_str(
            r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "turn.example.com:3478"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("TURN requires"));
    }

    #[test]
    fn zero_ring_timeout_disables_it() {
        let cfg = Config::from_json_str(r#"{"ring_timeout_secs": 0}"#).unwrap();
        assert!(cfg.ring_timeout().is_none());
    }

    #[test]
    fn reconnect_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 500,
            max_delay_ms: 3000,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(3000));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
