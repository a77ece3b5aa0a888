// ============================================================================
// Store Facade
// ============================================================================
//
// Unit of work bound to a single backend transaction: an identity-mapped
// entity cache, a change tracker, a deferred load queue, and the commit
// planner that drains pending changes in foreign-key order.
//
// ============================================================================

pub mod commit;
pub mod config;
pub mod deferred;
pub mod facade;
pub(crate) mod loader;

pub use commit::{CommitPlan, WriteStep};
pub use config::{CacheMode, FlushMode, StoreConfig};
pub use deferred::DeferredEntity;
pub use facade::{FindOptions, Store};
