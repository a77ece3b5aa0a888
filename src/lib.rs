// ============================================================================
// chainstage Library
// ============================================================================
//
// Write-staging and read-caching layer between block-processing handlers and
// a relational database, with chain-aware transactions: finalized-only block
// ranges and speculative "hot" blocks that can be rolled back on reorgs.
//
// ============================================================================

pub mod backend;
pub mod cache;
pub mod chain;
pub mod core;
pub mod defer;
pub mod entity;
pub mod prelude;
pub mod schema;
pub mod store;
pub mod tracker;

pub use backend::{
    BackendTransaction, Filter, FindQuery, IsolationLevel, MemoryBackend, OrderBy,
    PersistenceBackend,
};
pub use chain::{
    BlockRef, ChainConfig, ChainState, ChainTransactionManager, FinalTxInfo, HotTxInfo,
};
pub use core::{DataType, ErrorKind, Result, StoreError, Value};
pub use entity::{Entity, EntityKey, RelationMask, RelationValue};
pub use schema::{EntityTypeDef, RelationDef, SchemaRegistry};
pub use store::{CacheMode, DeferredEntity, FindOptions, FlushMode, Store, StoreConfig};

/// Boxed future returned by transaction writers.
///
/// ```ignore
/// manager
///     .transact(info, |store| {
///         Box::pin(async move {
///             store.insert(Entity::new("Transfer", "t1").with("amount", 5)).await
///         })
///     })
///     .await?;
/// ```
pub use futures::future::BoxFuture;
