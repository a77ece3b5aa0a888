//! Types needed by block handlers, grouped for a single glob import.
//!
//! `use chainstage::prelude::*;` brings in the schema builders, the entity
//! model, the store surface and the chain transaction entrypoints.

pub use crate::backend::{Filter, IsolationLevel, MemoryBackend, OrderBy, PersistenceBackend};
pub use crate::chain::{
    BlockRef, ChainConfig, ChainState, ChainTransactionManager, FinalTxInfo, HotTxInfo,
};
pub use crate::core::{DataType, Result, StoreError, Value};
pub use crate::entity::{Entity, RelationMask};
pub use crate::schema::{EntityTypeDef, RelationDef, SchemaRegistry};
pub use crate::store::{FindOptions, Store, StoreConfig};
pub use futures::future::BoxFuture;
