use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{behavior::DecayPreset, reward::RewardTable, Error, Result};

/// Configuration for [`Ranker`](crate::Ranker).
///
/// ```
/// # use jobrank::RankerConfig;
/// let config = RankerConfig::new()
///     .with_weights(0.7, 0.3)
///     .with_exposure_top_n(5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Weight of the similarity score in the hybrid score.
    pub vector_weight: f64,
    /// Weight of the bandit expected value in the hybrid score.
    pub bandit_weight: f64,
    /// How many candidates to request from similarity search per requested job.
    pub candidate_multiplier: usize,
    /// Maximum size of the recently-active fallback pool.
    pub fallback_limit: usize,
    /// How many of the presented jobs are logged as exposures.
    pub exposure_top_n: usize,
    /// Decay rate (per day) used for behavior ranking.
    pub decay_lambda: f64,
    /// Reward applied to the bandit for each feedback action.
    pub reward_table: RewardTable,
    /// Compare-and-swap attempts for a single feedback update before giving up.
    pub max_update_retries: u32,
    /// Initial backoff between compare-and-swap attempts. Doubles on every retry.
    pub update_backoff: Duration,
    /// Fixed RNG seed. Every request uses a fresh RNG seeded with this value; leave `None` in
    /// production.
    pub seed: Option<u64>,
    /// Exposure dispatcher settings.
    pub exposure: ExposureConfig,
}

impl RankerConfig {
    /// Default value for [`RankerConfig::vector_weight`].
    pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.6;
    /// Default value for [`RankerConfig::bandit_weight`].
    pub const DEFAULT_BANDIT_WEIGHT: f64 = 0.4;
    /// Default value for [`RankerConfig::candidate_multiplier`].
    pub const DEFAULT_CANDIDATE_MULTIPLIER: usize = 3;
    /// Default value for [`RankerConfig::fallback_limit`].
    pub const DEFAULT_FALLBACK_LIMIT: usize = 50;
    /// Default value for [`RankerConfig::exposure_top_n`].
    pub const DEFAULT_EXPOSURE_TOP_N: usize = 3;
    /// Default value for [`RankerConfig::max_update_retries`].
    pub const DEFAULT_MAX_UPDATE_RETRIES: u32 = 5;
    /// Default value for [`RankerConfig::update_backoff`].
    pub const DEFAULT_UPDATE_BACKOFF: Duration = Duration::from_millis(10);

    /// Create a new `RankerConfig` using default configuration.
    pub fn new() -> RankerConfig {
        RankerConfig::default()
    }

    /// Update the hybrid score weights.
    pub fn with_weights(mut self, vector_weight: f64, bandit_weight: f64) -> RankerConfig {
        self.vector_weight = vector_weight;
        self.bandit_weight = bandit_weight;
        self
    }

    /// Update how many search candidates are requested per returned job.
    pub fn with_candidate_multiplier(mut self, candidate_multiplier: usize) -> RankerConfig {
        self.candidate_multiplier = candidate_multiplier;
        self
    }

    /// Update the size of the recently-active fallback pool.
    pub fn with_fallback_limit(mut self, fallback_limit: usize) -> RankerConfig {
        self.fallback_limit = fallback_limit;
        self
    }

    /// Update how many presented jobs are logged as exposures.
    pub fn with_exposure_top_n(mut self, exposure_top_n: usize) -> RankerConfig {
        self.exposure_top_n = exposure_top_n;
        self
    }

    /// Use one of the standard decay rates for behavior ranking.
    pub fn with_decay(mut self, preset: DecayPreset) -> RankerConfig {
        self.decay_lambda = preset.lambda();
        self
    }

    /// Use a custom decay rate, per day.
    pub fn with_decay_lambda(mut self, decay_lambda: f64) -> RankerConfig {
        self.decay_lambda = decay_lambda;
        self
    }

    /// Update the action rewards.
    pub fn with_reward_table(mut self, reward_table: RewardTable) -> RankerConfig {
        self.reward_table = reward_table;
        self
    }

    /// Update retry policy for conflicting feedback writes.
    pub fn with_update_retries(mut self, max_retries: u32, backoff: Duration) -> RankerConfig {
        self.max_update_retries = max_retries;
        self.update_backoff = backoff;
        self
    }

    /// Make selection reproducible.
    pub fn with_seed(mut self, seed: u64) -> RankerConfig {
        self.seed = Some(seed);
        self
    }

    /// Update exposure dispatcher settings.
    pub fn with_exposure(mut self, exposure: ExposureConfig) -> RankerConfig {
        self.exposure = exposure;
        self
    }

    /// Check that weights and rates are usable.
    pub fn validate(&self) -> Result<()> {
        validate_weights(self.vector_weight, self.bandit_weight)?;
        if !self.decay_lambda.is_finite() || self.decay_lambda < 0.0 {
            return Err(Error::invalid_input(format!(
                "decay_lambda must be a non-negative number, got {}",
                self.decay_lambda
            )));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::invalid_input("candidate_multiplier must be positive"));
        }
        let table = &self.reward_table;
        if [table.view, table.click, table.save, table.apply, table.reject]
            .iter()
            .any(|reward| !reward.is_finite())
        {
            return Err(Error::invalid_input("rewards must be finite"));
        }
        self.exposure.validate()
    }
}

impl Default for RankerConfig {
    fn default() -> RankerConfig {
        RankerConfig {
            vector_weight: RankerConfig::DEFAULT_VECTOR_WEIGHT,
            bandit_weight: RankerConfig::DEFAULT_BANDIT_WEIGHT,
            candidate_multiplier: RankerConfig::DEFAULT_CANDIDATE_MULTIPLIER,
            fallback_limit: RankerConfig::DEFAULT_FALLBACK_LIMIT,
            exposure_top_n: RankerConfig::DEFAULT_EXPOSURE_TOP_N,
            decay_lambda: DecayPreset::default().lambda(),
            reward_table: RewardTable::default(),
            max_update_retries: RankerConfig::DEFAULT_MAX_UPDATE_RETRIES,
            update_backoff: RankerConfig::DEFAULT_UPDATE_BACKOFF,
            seed: None,
            exposure: ExposureConfig::default(),
        }
    }
}

pub(crate) fn validate_weights(vector_weight: f64, bandit_weight: f64) -> Result<()> {
    for (name, weight) in [
        ("vector_weight", vector_weight),
        ("bandit_weight", bandit_weight),
    ] {
        if !weight.is_finite() || weight < 0.0 {
            return Err(Error::invalid_input(format!(
                "{name} must be a non-negative number, got {weight}"
            )));
        }
    }
    Ok(())
}

/// Next retry delay: twice `delay`, capped at `ceiling`. Saturates instead of overflowing.
pub(crate) fn doubled(delay: Duration, ceiling: Duration) -> Duration {
    delay.saturating_mul(2).min(ceiling)
}

/// Configuration for the exposure dispatcher queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Tasks that can wait in the queue. When full, new tasks are dropped.
    pub queue_capacity: usize,
    /// Deliveries running at the same time.
    pub max_concurrent_deliveries: usize,
    /// Retries after the first failed delivery attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every retry, up to `max_retry_delay`.
    pub retry_interval: Duration,
    /// Upper bound on the delay between retries.
    pub max_retry_delay: Duration,
}

impl ExposureConfig {
    /// Default value for [`ExposureConfig::queue_capacity`].
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
    /// Default value for [`ExposureConfig::max_concurrent_deliveries`].
    pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 4;
    /// Default value for [`ExposureConfig::max_retries`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default value for [`ExposureConfig::retry_interval`].
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
    /// Default value for [`ExposureConfig::max_retry_delay`].
    pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create a new `ExposureConfig` using default configuration.
    pub fn new() -> ExposureConfig {
        ExposureConfig::default()
    }

    /// Update the queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> ExposureConfig {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Update how many deliveries may run at the same time.
    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> ExposureConfig {
        self.max_concurrent_deliveries = max;
        self
    }

    /// Update the delivery retry policy.
    pub fn with_retries(
        mut self,
        max_retries: u32,
        retry_interval: Duration,
        max_retry_delay: Duration,
    ) -> ExposureConfig {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self.max_retry_delay = max_retry_delay;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::invalid_input("exposure queue_capacity must be positive"));
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(Error::invalid_input(
                "exposure max_concurrent_deliveries must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for ExposureConfig {
    fn default() -> ExposureConfig {
        ExposureConfig {
            queue_capacity: ExposureConfig::DEFAULT_QUEUE_CAPACITY,
            max_concurrent_deliveries: ExposureConfig::DEFAULT_MAX_CONCURRENT_DELIVERIES,
            max_retries: ExposureConfig::DEFAULT_MAX_RETRIES,
            retry_interval: ExposureConfig::DEFAULT_RETRY_INTERVAL,
            max_retry_delay: ExposureConfig::DEFAULT_MAX_RETRY_DELAY,
        }
    }
}
