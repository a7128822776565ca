//! Ledger configuration.

use std::time::Duration;

use riptide_ids::AccountId;
use serde::{Deserialize, Serialize};

/// Parameters for one Snowball instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnowballParams {
    /// Sample size: number of peers polled per tick.
    pub k: usize,
    /// Quorum fraction in (0, 1]: minimum stake-weighted vote for a
    /// successful tick.
    pub alpha: f64,
    /// Required consecutive confirmations before deciding.
    pub beta: u32,
}

impl SnowballParams {
    /// Creates parameters with the given values.
    #[must_use]
    pub fn new(k: usize, alpha: f64, beta: u32) -> Self {
        Self { k, alpha, beta }
    }

    /// Validates the parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 {
            return Err("k must be positive".to_string());
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err("alpha must be within (0, 1]".to_string());
        }
        if self.beta == 0 {
            return Err("beta must be positive".to_string());
        }
        Ok(())
    }
}

/// An initial account allocation written at inception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    /// The allocated account.
    pub account: AccountId,
    /// Initial balance.
    pub balance: u64,
    /// Initial stake.
    pub stake: u64,
}

/// All ledger tunables in one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Snowball parameters for round consensus.
    pub query: SnowballParams,
    /// Snowball parameters for sync-target consensus.
    pub sync: SnowballParams,

    /// Depth window within which DAG leaves remain eligible parents.
    pub max_eligible_parents_depth_diff: u64,

    /// Base difficulty: minimum number of leading zero bits required of a
    /// critical transaction's identity hash.
    pub min_difficulty: u64,
    /// Multiplier applied when scaling difficulty by observed round pacing.
    pub difficulty_scale_factor: f64,
    /// Target inter-root delta in milliseconds.
    pub expected_consensus_time_ms: u64,
    /// Upper bound on the difficulty-timestamp window carried by critical
    /// transactions.
    pub max_difficulty_timestamps: usize,

    /// Fee deducted from the sender of every applied transaction.
    pub transaction_fee_amount: u64,
    /// Minimum stake for reward eligibility and the floor used when
    /// weighting votes.
    pub minimum_stake: u64,

    /// Size in bytes of one sync diff chunk.
    pub sync_chunk_size: usize,
    /// Entry bound on the chunk cache.
    pub chunk_cache_entries: usize,

    /// Timeout for gossip round-trips.
    pub gossip_timeout: Duration,
    /// Timeout for query round-trips.
    pub query_timeout: Duration,
    /// Back-off after deciding the network is not actually ahead of us.
    pub out_of_sync_backoff: Duration,
    /// Pacing delay for the out-of-sync detector.
    pub idle_poll_interval: Duration,
    /// Sleep while the broadcast queue is quiescent and nops are off.
    pub broadcast_idle_interval: Duration,

    /// Gossip debounce flush interval.
    pub debounce_interval: Duration,
    /// Gossip debounce byte bound.
    pub debounce_max_bytes: usize,

    /// Accepted clock skew for transaction timestamps, in milliseconds.
    pub max_timestamp_skew_ms: u64,

    /// Initial account allocations.
    pub genesis: Vec<GenesisAllocation>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query: SnowballParams::new(10, 0.8, 50),
            sync: SnowballParams::new(10, 0.8, 50),

            max_eligible_parents_depth_diff: 5,

            min_difficulty: 8,
            difficulty_scale_factor: 1.0,
            expected_consensus_time_ms: 1_000,
            max_difficulty_timestamps: 10,

            transaction_fee_amount: 2,
            minimum_stake: 100,

            sync_chunk_size: 1_048_576,
            chunk_cache_entries: 1_024,

            gossip_timeout: Duration::from_secs(3),
            query_timeout: Duration::from_secs(3),
            out_of_sync_backoff: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(10),
            broadcast_idle_interval: Duration::from_millis(100),

            debounce_interval: Duration::from_millis(50),
            debounce_max_bytes: 16_384,

            max_timestamp_skew_ms: 600_000,

            genesis: Vec::new(),
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.query.validate()?;
        self.sync.validate()?;

        if self.sync_chunk_size == 0 {
            return Err("sync_chunk_size must be positive".to_string());
        }
        if self.chunk_cache_entries == 0 {
            return Err("chunk_cache_entries must be positive".to_string());
        }
        if self.debounce_max_bytes == 0 {
            return Err("debounce_max_bytes must be positive".to_string());
        }
        if self.max_eligible_parents_depth_diff == 0 {
            return Err("max_eligible_parents_depth_diff must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_alpha() {
        let mut config = Config::default();
        config.query.alpha = 1.5;
        assert!(config.validate().is_err());

        config.query.alpha = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_k() {
        let mut config = Config::default();
        config.sync.k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_beta() {
        let mut config = Config::default();
        config.query.beta = 0;
        assert!(config.validate().is_err());
    }
}
