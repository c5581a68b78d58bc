//! dBFT consensus configuration

use crate::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Network magic used when none is configured ("DBFT" in ASCII)
pub const DEFAULT_NETWORK: u32 = 0x5446_4244;

/// dBFT consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbftConfig {
    /// Network magic mixed into every signature
    pub network: u32,
    /// Target block interval in milliseconds; also the view 0 timeout
    pub milliseconds_per_block: u64,
    /// Maximum transactions a PrepareRequest may reference
    pub max_transactions_per_block: usize,
    /// Cap on the exponent of the view timeout backoff
    pub max_timeout_shift: u8,
    /// How far ahead of local time a proposal timestamp may be, in block intervals
    pub max_block_timestamp_drift_blocks: u64,
    /// PrepareResponses buffered before their PrepareRequest; 0 means the committee size
    pub max_buffered_responses: usize,
    /// Broadcast a RecoveryRequest when the node starts
    pub recovery_on_start: bool,
}

impl Default for DbftConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK,
            milliseconds_per_block: 15_000,
            max_transactions_per_block: 512,
            max_timeout_shift: 8,
            max_block_timestamp_drift_blocks: 8,
            max_buffered_responses: 0,
            recovery_on_start: true,
        }
    }
}

impl DbftConfig {
    /// Create a configuration for `network` with the given block interval
    pub fn new(network: u32, milliseconds_per_block: u64) -> Self {
        Self {
            network,
            milliseconds_per_block,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DbftConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConsensusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ConsensusError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.milliseconds_per_block == 0 {
            return Err(ConsensusError::Config(
                "Block interval must be greater than 0".to_string(),
            ));
        }

        if self.max_transactions_per_block == 0
            || self.max_transactions_per_block > u16::MAX as usize
        {
            return Err(ConsensusError::Config(format!(
                "Max transactions per block must be between 1 and {}",
                u16::MAX
            )));
        }

        // the largest timeout must fit in a u64 of milliseconds
        if self.max_timeout_shift >= 32
            || self
                .milliseconds_per_block
                .checked_mul(1u64 << self.max_timeout_shift)
                .is_none()
        {
            return Err(ConsensusError::Config(format!(
                "Timeout shift {} overflows the block interval",
                self.max_timeout_shift
            )));
        }

        if self.max_block_timestamp_drift_blocks == 0 {
            return Err(ConsensusError::Config(
                "Timestamp drift must allow at least one block interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Round timeout for `view`: the block interval doubled per view, capped
    pub fn timeout_for_view(&self, view: u8) -> Duration {
        let shift = view.min(self.max_timeout_shift).min(31);
        let millis = self
            .milliseconds_per_block
            .saturating_mul(1u64 << shift);
        Duration::from_millis(millis)
    }

    /// Latest acceptable proposal timestamp given local time `now`
    pub fn max_proposal_timestamp(&self, now: u64) -> u64 {
        now.saturating_add(
            self.milliseconds_per_block
                .saturating_mul(self.max_block_timestamp_drift_blocks),
        )
    }

    /// Capacity of the early PrepareResponse buffer for a committee
    pub fn response_buffer_capacity(&self, committee_size: usize) -> usize {
        if self.max_buffered_responses == 0 {
            committee_size
        } else {
            self.max_buffered_responses
        }
    }

    /// Get block interval as Duration
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.milliseconds_per_block)
    }

    /// Set network magic
    pub fn with_network(mut self, network: u32) -> Self {
        self.network = network;
        self
    }

    /// Set maximum transactions per block
    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions_per_block = max;
        self
    }

    /// Set the timeout backoff cap
    pub fn with_max_timeout_shift(mut self, shift: u8) -> Self {
        self.max_timeout_shift = shift;
        self
    }

    /// Set the early response buffer size
    pub fn with_max_buffered_responses(mut self, size: usize) -> Self {
        self.max_buffered_responses = size;
        self
    }

    /// Enable or disable the startup RecoveryRequest
    pub fn with_recovery_on_start(mut self, enabled: bool) -> Self {
        self.recovery_on_start = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DbftConfig::default();
        assert_eq!(config.milliseconds_per_block, 15_000);
        assert_eq!(config.max_transactions_per_block, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DbftConfig::default();

        config.milliseconds_per_block = 0;
        assert!(config.validate().is_err());

        config.milliseconds_per_block = 1_000;
        config.max_transactions_per_block = 0;
        assert!(config.validate().is_err());

        config.max_transactions_per_block = 100;
        config.max_timeout_shift = 40;
        assert!(config.validate().is_err());

        config.max_timeout_shift = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_doubles_per_view_until_cap() {
        let config = DbftConfig::new(1, 1_000).with_max_timeout_shift(3);

        assert_eq!(config.timeout_for_view(0), Duration::from_millis(1_000));
        assert_eq!(config.timeout_for_view(1), Duration::from_millis(2_000));
        assert_eq!(config.timeout_for_view(2), Duration::from_millis(4_000));
        assert_eq!(config.timeout_for_view(3), Duration::from_millis(8_000));
        // capped
        assert_eq!(config.timeout_for_view(4), Duration::from_millis(8_000));
        assert_eq!(config.timeout_for_view(255), Duration::from_millis(8_000));
    }

    #[test]
    fn test_response_buffer_capacity() {
        let config = DbftConfig::default();
        assert_eq!(config.response_buffer_capacity(7), 7);
        assert_eq!(config.with_max_buffered_responses(3).response_buffer_capacity(7), 3);
    }

    #[test]
    fn test_max_proposal_timestamp() {
        let config = DbftConfig::new(1, 1_000);
        assert_eq!(config.max_proposal_timestamp(50_000), 58_000);
        assert_eq!(config.max_proposal_timestamp(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DbftConfig =
            serde_json::from_str(r#"{"network": 7, "milliseconds_per_block": 500}"#).unwrap();
        assert_eq!(config.network, 7);
        assert_eq!(config.milliseconds_per_block, 500);
        assert_eq!(config.max_timeout_shift, 8);
    }

    #[test]
    fn test_file_operations() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("dbft.json");

        let config = DbftConfig::new(42, 2_000)
            .with_max_transactions(64)
            .with_recovery_on_start(false);

        config.save_to_file(&file_path).unwrap();
        let loaded = DbftConfig::load_from_file(&file_path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("dbft.json");
        fs::write(&file_path, r#"{"milliseconds_per_block": 0}"#).unwrap();

        assert!(matches!(
            DbftConfig::load_from_file(&file_path),
            Err(ConsensusError::Config(_))
        ));
        assert!(DbftConfig::load_from_file(dir.path().join("missing.json")).is_err());
    }
}
