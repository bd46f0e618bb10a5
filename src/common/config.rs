use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::{Fork, Round};
use crate::error::ConfigError;

/// Timing of a single consensus instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Round 1 timeout in milliseconds (default: 3000)
    #[serde(default = "default_round_change_duration_ms")]
    pub round_change_duration_ms: u64,

    /// Growth factor of the timeout per round (default: 2.0)
    #[serde(default = "default_round_timeout_multiplier")]
    pub round_timeout_multiplier: f64,

    /// Upper bound of any round timeout in milliseconds (default: 120000)
    #[serde(default = "default_max_round_timeout_ms")]
    pub max_round_timeout_ms: u64,

    /// How long a round 1 leader waits before proposing (default: 1000)
    #[serde(default = "default_leader_pre_prepare_delay_ms")]
    pub leader_pre_prepare_delay_ms: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            round_change_duration_ms: default_round_change_duration_ms(),
            round_timeout_multiplier: default_round_timeout_multiplier(),
            max_round_timeout_ms: default_max_round_timeout_ms(),
            leader_pre_prepare_delay_ms: default_leader_pre_prepare_delay_ms(),
        }
    }
}

impl InstanceConfig {
    /// `base * multiplier^(round - 1)`, capped at `max_round_timeout_ms`.
    pub fn timeout_for_round(&self, round: Round) -> Duration {
        let exponent = round.saturating_sub(1).min(i32::MAX as u64) as i32;
        let scaled =
            self.round_change_duration_ms as f64 * self.round_timeout_multiplier.powi(exponent);
        let capped = scaled.min(self.max_round_timeout_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn leader_pre_prepare_delay(&self) -> Duration {
        Duration::from_millis(self.leader_pre_prepare_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_change_duration_ms == 0 {
            return Err(ConfigError::Invalid("round_change_duration_ms must be positive"));
        }
        if !(self.round_timeout_multiplier >= 1.0) {
            return Err(ConfigError::Invalid("round_timeout_multiplier must be at least 1"));
        }
        if self.max_round_timeout_ms < self.round_change_duration_ms {
            return Err(ConfigError::Invalid(
                "max_round_timeout_ms must not be below round_change_duration_ms",
            ));
        }
        Ok(())
    }
}

/// History sync parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum decided messages a peer returns per range request (default: 25)
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Extra attempts per page before the sync fails (default: 2)
    #[serde(default = "default_batch_retries")]
    pub batch_retries: usize,

    /// Per-peer request timeout in milliseconds (default: 5000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Peers queried concurrently (default: 10)
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            batch_retries: default_batch_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            max_fan_out: default_max_fan_out(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_page_size == 0 {
            return Err(ConfigError::Invalid("max_page_size must be positive"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive"));
        }
        if self.max_fan_out == 0 {
            return Err(ConfigError::Invalid("max_fan_out must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub instance: InstanceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    /// How long late commits are folded into a fresh decision (default: 6 minutes)
    #[serde(default = "default_late_commit_listen_ms")]
    pub late_commit_listen_ms: u64,

    /// Peers required before an instance starts when asked to wait (default: 1)
    #[serde(default = "default_min_peers")]
    pub min_peers: usize,

    /// Poll interval while waiting for peers (default: 500)
    #[serde(default = "default_min_peers_poll_ms")]
    pub min_peers_poll_ms: u64,

    #[serde(default)]
    pub fork: Fork,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance: InstanceConfig::default(),
            sync: SyncConfig::default(),
            late_commit_listen_ms: default_late_commit_listen_ms(),
            min_peers: default_min_peers(),
            min_peers_poll_ms: default_min_peers_poll_ms(),
            fork: Fork::default(),
        }
    }
}

impl ControllerConfig {
    pub fn late_commit_listen(&self) -> Duration {
        Duration::from_millis(self.late_commit_listen_ms)
    }

    pub fn min_peers_poll(&self) -> Duration {
        Duration::from_millis(self.min_peers_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.instance.validate()?;
        self.sync.validate()?;
        if self.min_peers_poll_ms == 0 {
            return Err(ConfigError::Invalid("min_peers_poll_ms must be positive"));
        }
        Ok(())
    }
}

fn default_round_change_duration_ms() -> u64 {
    3_000
}

fn default_round_timeout_multiplier() -> f64 {
    2.0
}

fn default_max_round_timeout_ms() -> u64 {
    120_000
}

fn default_leader_pre_prepare_delay_ms() -> u64 {
    1_000
}

fn default_max_page_size() -> usize {
    25
}

fn default_batch_retries() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_fan_out() -> usize {
    10
}

fn default_late_commit_listen_ms() -> u64 {
    6 * 60 * 1_000
}

fn default_min_peers() -> usize {
    1
}

fn default_min_peers_poll_ms() -> u64 {
    500
}
