// ============================================================================
// Entities
// ============================================================================
//
// Dynamic entity representation shared by the cache, the store facade and
// persistence backends. Field values are scalars; relations are either a
// single (possibly null) related entity or a loaded collection.
//
// A relation absent from `relations` is "not loaded", which is different
// from `RelationValue::One(None)` ("loaded, and null").
//
// ============================================================================

pub mod mask;

pub use mask::RelationMask;

use crate::core::Value;
use crate::schema::EntityTypeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a row: entity type plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity: EntityTypeId,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity: EntityTypeId, id: impl Into<String>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationValue {
    One(Option<Box<Entity>>),
    Many(Vec<Entity>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    entity_type: String,
    id: String,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    #[serde(default)]
    relations: BTreeMap<String, RelationValue>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Identity-only placeholder.
    pub fn stub(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(entity_type, id)
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Points an owning relation at `target_type`/`target_id`.
    pub fn with_ref(
        mut self,
        relation: impl Into<String>,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        self.set_ref(relation, Some(Entity::stub(target_type, target_id)));
        self
    }

    pub fn with_null(mut self, relation: impl Into<String>) -> Self {
        self.set_ref(relation, None);
        self
    }

    pub fn with_related(mut self, relation: impl Into<String>, entity: Entity) -> Self {
        self.set_ref(relation, Some(entity));
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn relations(&self) -> &BTreeMap<String, RelationValue> {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    /// Related entity of a single-valued relation, if loaded and not null.
    pub fn related(&self, name: &str) -> Option<&Entity> {
        match self.relations.get(name) {
            Some(RelationValue::One(Some(entity))) => Some(entity),
            _ => None,
        }
    }

    pub fn related_many(&self, name: &str) -> Option<&[Entity]> {
        match self.relations.get(name) {
            Some(RelationValue::Many(items)) => Some(items),
            _ => None,
        }
    }

    /// Foreign key held by a single-valued relation.
    ///
    /// `None` when the relation is not loaded, `Some(None)` when it is null.
    pub fn ref_id(&self, name: &str) -> Option<Option<&str>> {
        match self.relations.get(name) {
            Some(RelationValue::One(target)) => Some(target.as_deref().map(|e| e.id())),
            _ => None,
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn set_ref(&mut self, relation: impl Into<String>, target: Option<Entity>) {
        self.relations
            .insert(relation.into(), RelationValue::One(target.map(Box::new)));
    }

    pub fn set_relation(&mut self, relation: impl Into<String>, value: RelationValue) {
        self.relations.insert(relation.into(), value);
    }

    pub fn remove_field(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// True when only the identity is populated.
    pub fn is_stub(&self) -> bool {
        self.fields.is_empty() && self.relations.is_empty()
    }
}
