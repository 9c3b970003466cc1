//! Node configuration models.
//!
//! A node is configured from a TOML file:
//!
//! ```toml
//! role = "peer"
//! participantId = "site-a"
//! workingDirectory = "/var/lib/dcp"
//!
//! [broker]
//! host = "broker.example.org"
//! port = 1883
//!
//! [fileServer]
//! host = "central.example.org"
//! port = 3300
//! ```
//!
//! Every section except the identity fields has defaults matching a
//! standard deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use ts_rs::TS;

/// Size of one archive part: 20 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;

/// Role a node plays in every run it takes part in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Central,
    Peer,
}

/// Configuration of one pipeline manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    pub role: NodeRole,

    /// Identity of this node on the message bus.
    pub participant_id: String,

    /// Root of the per-run `input`, `output`, `transfer` and `system` trees.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub file_server: FileServerConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

impl ManagerConfig {
    pub fn new(role: NodeRole, participant_id: impl Into<String>, working_directory: PathBuf) -> Self {
        Self {
            role,
            participant_id: participant_id.into(),
            working_directory,
            broker: BrokerConfig::default(),
            file_server: FileServerConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".dcp")
}

/// MQTT broker connection settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Capacity of the outgoing request queue.
    pub capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            reconnect_delay_ms: 5000,
            capacity: 64,
        }
    }
}

/// HTTP file side-channel settings.
///
/// The central node binds `host:port`, peers connect to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase", default)]
pub struct FileServerConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub pathname: String,
}

impl FileServerConfig {
    /// Base URL of the transfer endpoint, e.g. `http://localhost:3300/transfer`.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.pathname
        )
    }
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 3300,
            pathname: "/transfer".to_string(),
        }
    }
}

/// Archive and retry settings of file transfers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub compression_level: u32,
    pub post_retry_limit: u32,
    pub get_retry_limit: u32,
    /// Delay unit of the linear backoff: attempt `n` waits `n * retryBaseDelayMs`.
    pub retry_base_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_level: 9,
            post_retry_limit: 100,
            get_retry_limit: 300,
            retry_base_delay_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_server_url() {
        let config = FileServerConfig::default();
        assert_eq!(config.url(), "http://localhost:3300/transfer");
    }

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 20_971_520);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.post_retry_limit, 100);
        assert_eq!(config.get_retry_limit, 300);
    }
}
