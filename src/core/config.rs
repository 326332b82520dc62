//! Timing and service configuration

use std::time::Duration;

use thiserror::Error;

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heartbeat interval {heartbeat:?} must be below the minimum election timeout {election_min:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        election_min: Duration,
    },
    #[error("election timeout range is empty: min {min:?} > max {max:?}")]
    EmptyElectionRange { min: Duration, max: Duration },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Configuration for Raft timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 50ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 600ms)
    pub election_timeout_max: Duration,
    /// Upper bound on a single peer RPC before it counts as lost (default: 100ms)
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(100),
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Check that the timers leave room for heartbeats between elections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Zero("rpc timeout"));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::EmptyElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_min: self.election_timeout_min,
            });
        }
        Ok(())
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

/// How `Get` requests are served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Answer from the local map; may return stale data
    #[default]
    Local,
    /// Route the read through the log like a write (linearizable)
    Log,
}

/// Configuration for the replicated key-value service
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// How long a `Put` waits for its entry to be applied (default: 1s)
    pub apply_timeout: Duration,
    /// Applied entries between state machine snapshots (default: 1000)
    /// Set to 0 to disable snapshots
    pub snapshot_threshold: u64,
    pub read_mode: ReadMode,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(1),
            snapshot_threshold: 1000,
            read_mode: ReadMode::Local,
        }
    }
}

impl KvConfig {
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set to 0 to disable automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }
}

/// Retry policy used by the client library
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts per operation before reporting failure (default: 5)
    pub max_attempts: usize,
    /// Pause between attempts (default: 100ms)
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}
