// ============================================================================
// Persistence Backends
// ============================================================================
//
// The store and the chain manager only talk to the database through these
// traits. A transaction handle is shared (`Arc`) between the store facade,
// the hot change recorder and the manager; all methods take `&self`.
//
// Besides entity rows a backend keeps three bookkeeping tables in its
// processor schema:
//
//   status     single row  (id = 0, height, hash, nonce)
//   hot_block  one row per unfinalized block (height, hash)
//   hot_change undo log    (block_height, index, change json)
//                          cascades on hot_block delete
//
// ============================================================================

pub mod memory;
pub mod query;

pub use memory::{JournalEntry, MemoryBackend};
pub use query::{Direction, Filter, FindQuery, OrderBy, field_value};

use crate::chain::{BlockRef, ChainStatus};
use crate::core::Result;
use crate::entity::Entity;
use crate::schema::EntityType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// One row of the hot change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub block_height: i64,
    pub index: u64,
    pub change: serde_json::Value,
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Arc<dyn BackendTransaction>>;
}

#[async_trait]
pub trait BackendTransaction: Send + Sync {
    /// Plain INSERT. Fails when a row with the same id exists.
    async fn insert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()>;

    /// INSERT .. ON CONFLICT (id) DO UPDATE for the fields present in each row.
    async fn upsert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()>;

    async fn delete(&self, entity: &EntityType, ids: &[String]) -> Result<()>;

    /// Rows with columns and owning foreign keys (as stubs) populated.
    async fn find(&self, entity: &EntityType, query: &FindQuery) -> Result<Vec<Entity>>;

    async fn count(&self, entity: &EntityType, filters: &[Filter]) -> Result<usize>;

    /// Reads the status row, creating `(-1, "0x", nonce 0)` when absent.
    async fn ensure_status(&self) -> Result<ChainStatus>;

    /// Hot blocks ordered by height.
    async fn hot_blocks(&self) -> Result<Vec<BlockRef>>;

    /// Moves the status row to `head` and bumps the nonce, guarded by
    /// `expected_nonce`. Returns the number of rows updated.
    async fn update_status(&self, expected_nonce: i64, head: &BlockRef) -> Result<u64>;

    async fn insert_hot_block(&self, block: &BlockRef) -> Result<()>;

    /// Removes a single hot block together with its change log.
    async fn delete_hot_block(&self, height: i64) -> Result<()>;

    /// Removes every hot block at or below `height`, with their change logs.
    async fn delete_hot_blocks(&self, up_to_height: i64) -> Result<()>;

    async fn append_change(
        &self,
        block_height: i64,
        index: u64,
        change: &serde_json::Value,
    ) -> Result<()>;

    /// Change log of one block ordered by index.
    async fn change_log(&self, block_height: i64) -> Result<Vec<ChangeLogEntry>>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}
