use crate::backend::IsolationLevel;
use crate::core::{Result, StoreError};
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};

/// Chain transaction manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Isolation level of every chain transaction.
    pub isolation_level: IsolationLevel,

    /// Whether `transact_hot` is allowed.
    pub support_hot_blocks: bool,

    /// Retries after a serialization failure before it is surfaced.
    pub max_serialization_retries: usize,

    /// First retry backoff; doubles per attempt up to `max_backoff_ms`.
    pub base_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Configuration of the stores handed to writers.
    #[serde(default)]
    pub store: StoreConfig,
}

impl ChainConfig {
    pub fn new() -> Self {
        Self {
            isolation_level: IsolationLevel::Serializable,
            support_hot_blocks: true,
            max_serialization_retries: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
            store: StoreConfig::default(),
        }
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn support_hot_blocks(mut self, enabled: bool) -> Self {
        self.support_hot_blocks = enabled;
        self
    }

    pub fn max_serialization_retries(mut self, retries: usize) -> Self {
        self.max_serialization_retries = retries;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.base_backoff_ms = base;
        self.max_backoff_ms = max;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(StoreError::InvalidUsage(
                "max_backoff_ms cannot be lower than base_backoff_ms".to_string(),
            ));
        }
        self.store.validate()
    }

    /// True when a failed attempt number `attempt` (1-based) may run again.
    pub(crate) fn should_retry(&self, attempt: usize, err: &StoreError) -> bool {
        attempt <= self.max_serialization_retries && err.is_serialization_failure()
    }

    /// Exponential backoff before retry number `attempt` (1-based).
    pub(crate) fn retry_backoff_ms(&self, attempt: usize) -> u64 {
        let cap = self.max_backoff_ms.max(self.base_backoff_ms);
        let mut backoff = self.base_backoff_ms;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::new()
    }
}
