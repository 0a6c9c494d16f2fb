use crate::error::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VeilhubConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub relay: RelayTuning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub addr: String,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_backoff_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9400".to_string(),
            ack_timeout_ms: default_ack_timeout_ms(),
            reconnect_min_backoff_ms: default_reconnect_min_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_min_backoff_ms),
            Duration::from_millis(self.reconnect_max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

/// Relay behaviour knobs. Defaults mirror the production client: 12-item
/// chunks, 16-byte corrupt threshold, 7 s commit window, and no origin-entry
/// eviction unless explicitly enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayTuning {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_min_payload_bytes")]
    pub min_payload_bytes: usize,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Optional max age for request-origin entries, as a humantime string
    /// (for example `"10m"`). Absent means entries live until consumed,
    /// matching the unbounded behaviour of the original client.
    #[serde(default)]
    pub origin_max_age: Option<String>,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_payload_bytes: default_min_payload_bytes(),
            commit_timeout_ms: default_commit_timeout_ms(),
            origin_max_age: None,
        }
    }
}

impl RelayTuning {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn origin_max_age(&self) -> Result<Option<Duration>> {
        match self.origin_max_age.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                Ok(Some(humantime::parse_duration(raw.trim())?))
            }
            _ => Ok(None),
        }
    }
}

const fn default_ack_timeout_ms() -> u64 {
    7_000
}

const fn default_reconnect_min_ms() -> u64 {
    250
}

const fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_socket_path() -> String {
    "/tmp/veilhub.sock".to_string()
}

const fn default_chunk_size() -> usize {
    12
}

const fn default_min_payload_bytes() -> usize {
    16
}

const fn default_commit_timeout_ms() -> u64 {
    7_000
}

impl VeilhubConfig {
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/veilhub").required(false))
            .add_source(Environment::with_prefix("VEILHUB").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("VEILHUB").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_production_client() {
        let tuning = RelayTuning::default();
        assert_eq!(tuning.chunk_size, 12);
        assert_eq!(tuning.min_payload_bytes, 16);
        assert_eq!(tuning.commit_timeout(), Duration::from_secs(7));
        assert_eq!(tuning.origin_max_age().expect("parse"), None);
    }

    #[test]
    fn origin_max_age_parses_humantime_strings() {
        let tuning = RelayTuning {
            origin_max_age: Some("10m".to_string()),
            ..RelayTuning::default()
        };
        assert_eq!(
            tuning.origin_max_age().expect("parse"),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn origin_max_age_rejects_garbage() {
        let tuning = RelayTuning {
            origin_max_age: Some("soon".to_string()),
            ..RelayTuning::default()
        };
        assert!(tuning.origin_max_age().is_err());
    }
}
