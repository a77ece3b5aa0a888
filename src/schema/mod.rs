// ============================================================================
// Entity Schema Registry
// ============================================================================
//
// Static description of entity types, their columns and relations. Built
// once through explicit registration and read-only afterwards.
//
// ============================================================================

pub mod commit_order;
pub mod entity_type;
pub mod registry;

pub use commit_order::CommitOrder;
pub use entity_type::{
    Cardinality, EntityType, EntityTypeDef, EntityTypeId, Relation, RelationDef,
};
pub use registry::{SchemaBuilder, SchemaRegistry};
