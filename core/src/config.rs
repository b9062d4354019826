//! Executor and pool settings

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::{Error, Result};

/// Default per-command deadline
pub const DEFAULT_SERVER_OP_TIMEOUT_MS: u64 = 10_000;

/// Default mode for copied files
pub const DEFAULT_FILE_MODE: &str = "0744";

/// Mode used when copying in-memory data
pub const DEFAULT_BYTES_MODE: &str = "0600";

/// Probe command run by `validate`
pub const VALIDATE_COMMAND: &str = "date";

/// Settings for [`SshExecutor`](crate::SshExecutor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline applied when a command gives none
    pub server_op_timeout_ms: u64,
    /// How long to wait for a pooled connection
    pub borrow_timeout_ms: u64,
    /// Concurrent channel opens
    pub open_workers: usize,
    /// Channel opens allowed to wait for a worker
    pub open_queue: usize,
    /// Concurrent running commands
    pub run_workers: usize,
    /// Commands allowed to wait for a worker
    pub run_queue: usize,
    /// Time in-flight jobs get to finish on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            server_op_timeout_ms: DEFAULT_SERVER_OP_TIMEOUT_MS,
            borrow_timeout_ms: 5_000,
            open_workers: 100,
            open_queue: 100,
            run_workers: 200,
            run_queue: 1_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    pub fn server_op_timeout(&self) -> Duration {
        Duration::from_millis(self.server_op_timeout_ms)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject settings that would make a pool unusable
    pub fn validate(&self) -> Result<()> {
        if self.open_workers == 0 || self.run_workers == 0 {
            return Err(Error::Config(
                "worker counts must be greater than zero".to_string(),
            ));
        }
        for (name, workers, queue) in [
            ("open", self.open_workers, self.open_queue),
            ("run", self.run_workers, self.run_queue),
        ] {
            let total = workers.checked_add(queue);
            if total.map_or(true, |total| total > Semaphore::MAX_PERMITS) {
                return Err(Error::Config(format!(
                    "{}_workers + {}_queue must not exceed {}",
                    name,
                    name,
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        if self.server_op_timeout_ms == 0 {
            return Err(Error::Config(
                "server_op_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for [`KeyedPool`](crate::KeyedPool)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections lent out at once per host
    pub max_per_host: usize,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: 8,
            max_idle_per_host: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.open_workers, 100);
        assert_eq!(config.open_queue, 100);
        assert_eq!(config.run_workers, 200);
        assert_eq!(config.run_queue, 1_000);
        assert_eq!(config.server_op_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ExecutorConfig = toml::from_str("server_op_timeout_ms = 3000").unwrap();
        assert_eq!(config.server_op_timeout_ms, 3000);
        assert_eq!(config.run_workers, 200);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ExecutorConfig {
            run_workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_oversized_queue_rejected() {
        let config = ExecutorConfig {
            run_queue: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ExecutorConfig {
            open_queue: Semaphore::MAX_PERMITS,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
