//! Server group configuration
//!
//! Every field is required; there is no `Default` and no `#[serde(default)]`.
//! The affinity list and the queue geometry depend on the host.

use crate::{RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`ServerGroup`](crate::ServerGroup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroupConfig {
    /// CPU cores, one per cluster. Defines the number of clusters per device
    /// and the pinning of both cluster threads and resource pools.
    pub affinities: Vec<usize>,
    /// Completion-channel wait in blocking mode and resource allocation budget.
    pub timeout_ms: u64,
    /// Largest send payload posted inline.
    pub max_inline: u32,
    /// Busy-poll completion queues instead of waiting on the completion channel.
    pub polling: bool,
    /// Receive queue depth per queue pair.
    pub recv_queue: u32,
    /// Send queue depth per queue pair.
    pub send_queue: u32,
    /// Maximum completions drained per processing pass.
    pub poll_size: usize,
    /// Connections sharing one completion queue; sizes each cluster's CQ.
    pub cluster_size: u32,
    /// Size of one receive or send slot in bytes.
    pub buffer_size: usize,
    /// Registered memory budget per resource pool in bytes.
    pub pool_memory_limit: usize,
}

impl ServerGroupConfig {
    /// Load a configuration from a TOML file and validate it.
    pub fn from_toml_file(path: impl AsRef<Path>) -> RpcResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> RpcResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| RpcError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the group cannot run with.
    pub fn validate(&self) -> RpcResult<()> {
        if self.affinities.is_empty() {
            return Err(RpcError::invalid_config("affinity list is empty"));
        }
        let checks = [
            ("recv_queue", self.recv_queue as usize),
            ("send_queue", self.send_queue as usize),
            ("poll_size", self.poll_size),
            ("cluster_size", self.cluster_size as usize),
            ("buffer_size", self.buffer_size),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(RpcError::invalid_config(format!("{name} must be non-zero")));
            }
        }
        if self.pool_memory_limit < self.slab_len() {
            return Err(RpcError::invalid_config(format!(
                "pool_memory_limit {} cannot hold one connection ({} bytes)",
                self.pool_memory_limit,
                self.slab_len()
            )));
        }
        Ok(())
    }

    /// Number of clusters per device instance.
    pub fn nbr_of_clusters(&self) -> usize {
        self.affinities.len()
    }

    /// Capacity of each cluster's completion queue.
    ///
    /// Every queue pair can have `recv_queue + send_queue` outstanding
    /// completions and `cluster_size` queue pairs share one queue.
    pub fn cq_capacity(&self) -> usize {
        (self.recv_queue as usize + self.send_queue as usize) * self.cluster_size as usize
    }

    /// Registered bytes needed by one connection.
    pub fn slab_len(&self) -> usize {
        (self.recv_queue as usize + self.send_queue as usize) * self.buffer_size
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
pub(crate) fn test_config(affinities: Vec<usize>) -> ServerGroupConfig {
    ServerGroupConfig {
        affinities,
        timeout_ms: 500,
        max_inline: 64,
        polling: false,
        recv_queue: 4,
        send_queue: 4,
        poll_size: 16,
        cluster_size: 4,
        buffer_size: 256,
        pool_memory_limit: 1024 * 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cq_capacity() {
        let config = test_config(vec![0, 1]);
        // (4 + 4) * 4
        assert_eq!(config.cq_capacity(), 32);
        assert_eq!(config.slab_len(), 8 * 256);
        assert_eq!(config.nbr_of_clusters(), 2);
    }

    #[test]
    fn test_validate_rejects_empty_affinities() {
        let config = test_config(Vec::new());
        assert!(matches!(
            config.validate(),
            Err(RpcError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = test_config(vec![0]);
        config.poll_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_size"));

        let mut config = test_config(vec![0]);
        config.pool_memory_limit = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_requires_every_field() {
        let partial = "affinities = [0, 1]\ntimeout_ms = 100\n";
        assert!(matches!(
            ServerGroupConfig::from_toml_str(partial),
            Err(RpcError::InvalidConfig { .. })
        ));

        let full = r#"
            affinities = [2, 3]
            timeout_ms = 1000
            max_inline = 64
            polling = true
            recv_queue = 16
            send_queue = 16
            poll_size = 32
            cluster_size = 8
            buffer_size = 4096
            pool_memory_limit = 67108864
        "#;
        let config = ServerGroupConfig::from_toml_str(full).unwrap();
        assert_eq!(config.affinities, vec![2, 3]);
        assert!(config.polling);
        assert_eq!(config.timeout(), Duration::from_secs(1));
    }
}
