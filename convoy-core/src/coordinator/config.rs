//! Cluster configuration
//!
//! Per-node coordination settings. Environment variables use the `CONVOY_`
//! prefix; durations are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::membership::ControlAddress;
use crate::error::{ConvoyError, Result};
use crate::transport::RetryPolicy;

/// How much coordination a node takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityMode {
    /// Full coordination: election, health checks, reconciliation
    #[default]
    Balanced,
    /// Single node that leads without an election
    Solo,
    /// No coordination; agents are never started
    Serverless,
    /// Like serverless, and inbound commands are not consumed
    MediatorOnly,
}

impl DurabilityMode {
    /// Whether the node runs the coordination loops at all
    pub fn coordinates(&self) -> bool {
        matches!(self, DurabilityMode::Balanced | DurabilityMode::Solo)
    }

    /// Whether the node consumes its command inbox
    pub fn listens(&self) -> bool {
        !matches!(self, DurabilityMode::MediatorOnly)
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DurabilityMode::Balanced => "balanced",
            DurabilityMode::Solo => "solo",
            DurabilityMode::Serverless => "serverless",
            DurabilityMode::MediatorOnly => "mediator_only",
        };
        f.write_str(name)
    }
}

impl FromStr for DurabilityMode {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "balanced" => Ok(DurabilityMode::Balanced),
            "solo" => Ok(DurabilityMode::Solo),
            "serverless" => Ok(DurabilityMode::Serverless),
            "mediator_only" | "mediatoronly" => Ok(DurabilityMode::MediatorOnly),
            other => Err(ConvoyError::InvalidConfig {
                reason: format!("unknown durability mode '{}'", other),
            }),
        }
    }
}

/// Configuration for one cluster node
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Coordination level
    pub durability: DurabilityMode,
    /// Address this node receives commands on
    pub control_address: ControlAddress,
    /// Silence after which a node is considered dead
    pub stale_threshold: Duration,
    /// Liveness record refresh period
    pub heartbeat_interval: Duration,
    /// Leadership claim/check period
    pub election_interval: Duration,
    /// Eviction sweep period (leader only)
    pub health_check_interval: Duration,
    /// Placement reconciliation period (leader only)
    pub reconcile_interval: Duration,
    /// Time an agent gets to finish in-flight work on stop
    pub drain_timeout: Duration,
    /// Delivery attempts per command, including the first
    pub command_retry_attempts: u32,
    /// First retry delay; doubles every attempt
    pub command_retry_base_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Balanced,
            control_address: ControlAddress::new("mem://node"),
            stale_threshold: Duration::from_secs(crate::DEFAULT_STALE_THRESHOLD_SECS),
            heartbeat_interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            election_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(10),
            command_retry_attempts: 3,
            command_retry_base_delay: Duration::from_millis(100),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConvoyError::InvalidConfig {
                reason: format!("{}='{}': {}", name, value, e),
            }),
        Err(_) => Ok(default),
    }
}

impl ClusterConfig {
    /// Defaults overridden by `CONVOY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let durability = match std::env::var("CONVOY_DURABILITY") {
            Ok(mode) => mode.parse()?,
            Err(_) => defaults.durability,
        };
        let command_retry_attempts = match std::env::var("CONVOY_COMMAND_RETRY_ATTEMPTS") {
            Ok(value) => value.trim().parse().map_err(|e| ConvoyError::InvalidConfig {
                reason: format!("CONVOY_COMMAND_RETRY_ATTEMPTS='{}': {}", value, e),
            })?,
            Err(_) => defaults.command_retry_attempts,
        };

        let config = Self {
            durability,
            control_address: std::env::var("CONVOY_CONTROL_ADDRESS")
                .map(ControlAddress::new)
                .unwrap_or(defaults.control_address),
            stale_threshold: env_millis("CONVOY_STALE_THRESHOLD_MS", defaults.stale_threshold)?,
            heartbeat_interval: env_millis("CONVOY_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            election_interval: env_millis("CONVOY_ELECTION_INTERVAL_MS", defaults.election_interval)?,
            health_check_interval: env_millis("CONVOY_HEALTH_CHECK_INTERVAL_MS", defaults.health_check_interval)?,
            reconcile_interval: env_millis("CONVOY_RECONCILE_INTERVAL_MS", defaults.reconcile_interval)?,
            drain_timeout: env_millis("CONVOY_DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            command_retry_attempts,
            command_retry_base_delay: env_millis(
                "CONVOY_COMMAND_RETRY_BASE_DELAY_MS",
                defaults.command_retry_base_delay,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which liveness cannot work
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("election_interval", self.election_interval),
            ("health_check_interval", self.health_check_interval),
            ("reconcile_interval", self.reconcile_interval),
            ("stale_threshold", self.stale_threshold),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConvoyError::InvalidConfig {
                    reason: format!("{} must be non-zero", name),
                });
            }
        }
        if self.heartbeat_interval >= self.stale_threshold {
            return Err(ConvoyError::InvalidConfig {
                reason: format!(
                    "heartbeat_interval {:?} must be shorter than stale_threshold {:?}",
                    self.heartbeat_interval, self.stale_threshold
                ),
            });
        }
        if self.command_retry_attempts == 0 {
            return Err(ConvoyError::InvalidConfig {
                reason: "command_retry_attempts must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.command_retry_attempts,
            base_delay: self.command_retry_base_delay,
        }
    }
}
