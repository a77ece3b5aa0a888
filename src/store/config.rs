use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// When pending changes are written to the transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Sync after every write operation.
    Always,
    /// Sync before every read, so reads observe pending writes.
    #[default]
    Auto,
    /// Sync only on explicit `flush` or at the end of the transaction.
    Batch,
}

/// What a read puts into the entity cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Every entity returned by a read, nested ones included.
    #[default]
    All,
    /// Only entities requested through `defer`.
    Requested,
}

/// Store facade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub flush_mode: FlushMode,
    pub cache_mode: CacheMode,
    /// Maximum ids per deferred batch fetch.
    pub defer_batch_size: usize,
    /// Maximum rows per INSERT/UPSERT/DELETE statement.
    pub write_batch_size: usize,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            cache_mode: CacheMode::All,
            defer_batch_size: 1000,
            write_batch_size: 1000,
        }
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn defer_batch_size(mut self, size: usize) -> Self {
        self.defer_batch_size = size;
        self
    }

    pub fn write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.defer_batch_size == 0 {
            return Err(StoreError::InvalidUsage(
                "defer_batch_size must be > 0".to_string(),
            ));
        }
        if self.write_batch_size == 0 {
            return Err(StoreError::InvalidUsage(
                "write_batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
