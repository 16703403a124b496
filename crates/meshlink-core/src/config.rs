//! Link layer configuration.
//!
//! Every knob defaults to the protocol constant of the component it shapes,
//! so an empty TOML document yields the standard 802.15.4 CSMA/CA setup.
//! Pools are sized from this configuration once, when the
//! [`LinkLayer`](crate::stack::LinkLayer) is built.

use crate::anti_replay;
use crate::csma;
use crate::error::ConfigError;
use crate::link_stats;
use crate::liveness;
use crate::neighbor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete link layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Secured neighbor table capacity (also bounds the link stats table)
    pub neighbor_table_size: usize,
    /// Seed for backoff and jitter randomness; `None` seeds from the OS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
    /// Backoff shape and pool sizing
    pub csma: CsmaConfig,
    /// Link quality estimator shape
    pub link_stats: LinkStatsConfig,
    /// Frame counter wire format
    pub anti_replay: AntiReplayConfig,
    /// Liveness sweep timing
    pub liveness: LivenessConfig,
}

/// CSMA scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsmaConfig {
    /// Initial backoff exponent
    pub min_be: u8,
    /// Maximum backoff exponent
    pub max_be: u8,
    /// Collisions tolerated before an attempt is charged
    pub max_backoff: u8,
    /// Retransmissions after the first attempt
    pub max_frame_retries: u8,
    /// Concurrent neighbor queues
    pub max_neighbor_queues: usize,
    /// Packets queued per neighbor
    pub max_packet_per_neighbor: usize,
    /// Packets queued in total
    pub max_queued_packets: usize,
    /// Backoff unit when the RDC reports no channel check interval (µs)
    pub backoff_period_us: u64,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            min_be: csma::MIN_BE,
            max_be: csma::MAX_BE,
            max_backoff: csma::MAX_BACKOFF,
            max_frame_retries: csma::MAX_FRAME_RETRIES,
            max_neighbor_queues: csma::MAX_NEIGHBOR_QUEUES,
            max_packet_per_neighbor: csma::MAX_PACKET_PER_NEIGHBOR,
            max_queued_packets: csma::MAX_QUEUED_PACKETS,
            backoff_period_us: csma::FALLBACK_BACKOFF_PERIOD_US,
        }
    }
}

impl CsmaConfig {
    /// Transmission limit applied when neither caller nor packet sets one
    #[must_use]
    pub fn default_max_transmissions(&self) -> u16 {
        u16::from(self.max_frame_retries) + 1
    }

    /// Fallback backoff unit
    #[must_use]
    pub fn backoff_period(&self) -> Duration {
        Duration::from_micros(self.backoff_period_us)
    }
}

/// Link quality estimator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkStatsConfig {
    /// Interval at which every freshness counter is halved (seconds)
    pub freshness_half_life_secs: u64,
    /// Freshness needed before the steady-state alpha applies
    pub freshness_target: u8,
    /// Saturation value of the freshness counter
    pub freshness_max: u8,
    /// An estimate older than this is never fresh (seconds)
    pub freshness_expiration_secs: u64,
    /// Steady-state EWMA weight, out of 100
    pub alpha: u16,
    /// EWMA weight while the estimate is not fresh, out of 100
    pub bootstrap_alpha: u16,
    /// Transmission count charged for a NOACK
    pub noack_penalty: u16,
}

impl Default for LinkStatsConfig {
    fn default() -> Self {
        Self {
            freshness_half_life_secs: link_stats::FRESHNESS_HALF_LIFE.as_secs(),
            freshness_target: link_stats::FRESHNESS_TARGET,
            freshness_max: link_stats::FRESHNESS_MAX,
            freshness_expiration_secs: link_stats::FRESHNESS_EXPIRATION_TIME.as_secs(),
            alpha: link_stats::EWMA_ALPHA,
            bootstrap_alpha: link_stats::EWMA_BOOTSTRAP_ALPHA,
            noack_penalty: link_stats::ETX_NOACK_PENALTY,
        }
    }
}

impl LinkStatsConfig {
    /// Aging interval
    #[must_use]
    pub fn freshness_half_life(&self) -> Duration {
        Duration::from_secs(self.freshness_half_life_secs)
    }

    /// Recency window of a fresh estimate
    #[must_use]
    pub fn freshness_expiration(&self) -> Duration {
        Duration::from_secs(self.freshness_expiration_secs)
    }
}

/// Anti-replay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiReplayConfig {
    /// Carry only the counter's low byte on the wire
    pub with_suppression: bool,
}

impl Default for AntiReplayConfig {
    fn default() -> Self {
        Self {
            with_suppression: anti_replay::WITH_SUPPRESSION,
        }
    }
}

/// Liveness sweep configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Base period between sweeps (seconds)
    pub update_check_interval_secs: u64,
    /// Upper bound of the random delay added to each period (seconds)
    pub update_check_jitter_secs: u64,
    /// How long to wait for a refresh after an UPDATE (seconds)
    pub updateack_waiting_period_secs: u64,
    /// Retransmissions of an UPDATE command
    pub max_retransmissions: u8,
    /// Expiry extension granted by an UPDATE or UPDATEACK (seconds)
    pub neighbor_lifetime_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            update_check_interval_secs: liveness::UPDATE_CHECK_INTERVAL.as_secs(),
            update_check_jitter_secs: liveness::UPDATE_CHECK_JITTER.as_secs(),
            updateack_waiting_period_secs: liveness::UPDATEACK_WAITING_PERIOD.as_secs(),
            max_retransmissions: liveness::MAX_RETRANSMISSIONS,
            neighbor_lifetime_secs: liveness::NEIGHBOR_LIFETIME.as_secs(),
        }
    }
}

impl LivenessConfig {
    /// Base sweep period
    #[must_use]
    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    /// Sweep jitter bound
    #[must_use]
    pub fn update_check_jitter(&self) -> Duration {
        Duration::from_secs(self.update_check_jitter_secs)
    }

    /// UPDATEACK wait
    #[must_use]
    pub fn updateack_waiting_period(&self) -> Duration {
        Duration::from_secs(self.updateack_waiting_period_secs)
    }

    /// Expiry extension on refresh
    #[must_use]
    pub fn neighbor_lifetime(&self) -> Duration {
        Duration::from_secs(self.neighbor_lifetime_secs)
    }

    /// Transmission limit of an UPDATE command
    #[must_use]
    pub fn update_max_transmissions(&self) -> u16 {
        u16::from(self.max_retransmissions) + 1
    }
}

impl LinkConfig {
    /// Parse a TOML document; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::Invalid`] if the result fails [`LinkConfig::validate`].
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`LinkConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject inconsistent configurations
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let csma = &self.csma;
        if csma.min_be > csma.max_be {
            return Err(ConfigError::Invalid("csma.min_be exceeds csma.max_be".into()));
        }
        if csma.max_be > csma::MAX_BE_LIMIT {
            return Err(ConfigError::Invalid(
                format!("csma.max_be must be at most {}", csma::MAX_BE_LIMIT).into(),
            ));
        }
        if csma.max_neighbor_queues == 0 || csma.max_queued_packets == 0 {
            return Err(ConfigError::Invalid("csma pool sizes must be non-zero".into()));
        }
        if csma.max_packet_per_neighbor == 0 {
            return Err(ConfigError::Invalid(
                "csma.max_packet_per_neighbor must be non-zero".into(),
            ));
        }
        if csma.backoff_period_us == 0 {
            return Err(ConfigError::Invalid("csma.backoff_period_us must be non-zero".into()));
        }

        let stats = &self.link_stats;
        if stats.alpha >= link_stats::EWMA_SCALE || stats.bootstrap_alpha >= link_stats::EWMA_SCALE {
            return Err(ConfigError::Invalid(
                format!("link_stats alphas must be below {}", link_stats::EWMA_SCALE).into(),
            ));
        }
        if stats.freshness_target > stats.freshness_max {
            return Err(ConfigError::Invalid(
                "link_stats.freshness_target exceeds link_stats.freshness_max".into(),
            ));
        }
        if stats.freshness_half_life_secs == 0 {
            return Err(ConfigError::Invalid(
                "link_stats.freshness_half_life_secs must be non-zero".into(),
            ));
        }
        if stats.noack_penalty == 0 {
            return Err(ConfigError::Invalid("link_stats.noack_penalty must be non-zero".into()));
        }

        let live = &self.liveness;
        if live.update_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "liveness.update_check_interval_secs must be non-zero".into(),
            ));
        }
        if live.updateack_waiting_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "liveness.updateack_waiting_period_secs must be non-zero".into(),
            ));
        }

        if self.neighbor_table_size == 0 {
            return Err(ConfigError::Invalid("neighbor_table_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            csma: CsmaConfig::default(),
            link_stats: LinkStatsConfig::default(),
            anti_replay: AntiReplayConfig::default(),
            liveness: LivenessConfig::default(),
            neighbor_table_size: neighbor::DEFAULT_TABLE_SIZE,
            rng_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = LinkConfig::default();
        assert_eq!(config.csma.min_be, 0);
        assert_eq!(config.csma.max_be, 4);
        assert_eq!(config.csma.max_backoff, 5);
        assert_eq!(config.csma.default_max_transmissions(), 8);
        assert_eq!(config.csma.max_neighbor_queues, 2);
        assert_eq!(config.link_stats.freshness_target, 4);
        assert_eq!(config.liveness.updateack_waiting_period(), Duration::from_secs(15));
        assert_eq!(config.liveness.update_max_transmissions(), 3);
        assert!(!config.anti_replay.with_suppression);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = LinkConfig::from_toml_str(
            r#"
            rng_seed = 7

            [csma]
            max_neighbor_queues = 4

            [anti_replay]
            with_suppression = true
            "#,
        )
        .unwrap();

        assert_eq!(config.csma.max_neighbor_queues, 4);
        assert_eq!(config.csma.max_be, 4);
        assert!(config.anti_replay.with_suppression);
        assert_eq!(config.rng_seed, Some(7));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = LinkConfig::default();
        config.liveness.max_retransmissions = 4;
        let text = config.to_toml_string().unwrap();
        assert_eq!(LinkConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut config = LinkConfig::default();
        config.csma.min_be = 5;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.csma.max_queued_packets = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.link_stats.alpha = 100;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.link_stats.freshness_target = 20;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.liveness.updateack_waiting_period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            LinkConfig::from_toml_str("csma = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            LinkConfig::load("/nonexistent/meshlink.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
