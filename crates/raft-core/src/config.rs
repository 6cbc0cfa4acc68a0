//! # config
//!
//! why: timing and retry knobs supplied once at node construction
//! relations: read by node.rs (batch size) and by raft-runtime (timers, retries, rpc bounds)
//! what: RaftConfig with defaults, validation, Duration accessors

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Cluster timing configuration. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Period of the leader's AppendEntries fan-out
    pub heartbeat_interval: u64,
    /// Extra attempts per peer RPC before the round is abandoned
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub retry_delay: u64,
    /// Bound on a single RPC attempt
    pub rpc_timeout: u64,
    /// Bound on a client proposal waiting for commit
    pub propose_timeout: u64,
    /// Cap on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_retries: 3,
            retry_delay: 20,
            rpc_timeout: 100,
            propose_timeout: 5_000,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_max == 0 {
            return Err(invalid("election timeouts must be positive"));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(invalid(
                "election_timeout_min cannot be greater than election_timeout_max",
            ));
        }
        if self.heartbeat_interval == 0 {
            return Err(invalid("heartbeat_interval must be positive"));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(invalid(
                "heartbeat_interval must be shorter than election_timeout_min",
            ));
        }
        if self.rpc_timeout == 0 || self.propose_timeout == 0 {
            return Err(invalid("rpc_timeout and propose_timeout must be positive"));
        }
        if self.max_entries_per_append == 0 {
            return Err(invalid("max_entries_per_append must be positive"));
        }
        Ok(())
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min),
            Duration::from_millis(self.election_timeout_max),
        )
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout)
    }
}

fn invalid(reason: &str) -> RaftError {
    RaftError::InvalidConfig(reason.to_string())
}
