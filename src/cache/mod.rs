// ============================================================================
// Entity Cache
// ============================================================================
//
// Identity map mirroring the relational schema. Cached values hold scalar
// fields and owning-relation foreign keys only; nested entities are never
// embedded, a second lookup resolves them. Inverse collections are never
// cached.
//
// Entry states:
// - no entry          -> unknown
// - entry, value None -> known not to exist (or requested, pending load)
// - entry, value Some -> known fields/refs, possibly partial
//
// ============================================================================

use crate::core::{Result, StoreError, Value};
use crate::entity::{Entity, EntityKey, RelationMask, RelationValue};
use crate::schema::SchemaRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedValue {
    fields: BTreeMap<String, Value>,
    refs: BTreeMap<String, Option<String>>,
}

impl CachedValue {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// `None` when the relation was never populated.
    pub fn ref_id(&self, relation: &str) -> Option<Option<&str>> {
        self.refs.get(relation).map(|id| id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Option<CachedValue>,
}

/// Result of cloning a cached value for a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    Found(Entity),
    /// Known not to exist.
    Missing,
    /// The cache cannot answer with the requested mask; read the database.
    Indeterminate,
}

pub struct EntityCache {
    schema: Arc<SchemaRegistry>,
    entries: HashMap<EntityKey, CacheEntry>,
}

impl EntityCache {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            entries: HashMap::new(),
        }
    }

    /// Merges `entity` into the cache.
    ///
    /// Relations named by `mask` are claimed loaded: nested entities under
    /// them are added first, and a bare stub must point at a cached identity.
    pub fn add(&mut self, entity: &Entity, mask: &RelationMask) -> Result<EntityKey> {
        let schema = Arc::clone(&self.schema);
        let ty = schema.resolve(entity.entity_type())?;
        let key = EntityKey::new(ty.id(), entity.id());

        for (name, value) in entity.fields() {
            let column = ty.column(name).ok_or_else(|| StoreError::UnknownField {
                entity: ty.name().to_string(),
                field: name.clone(),
            })?;
            column.validate(value)?;
        }

        let mut refs = Vec::new();
        for (name, value) in entity.relations() {
            let rel = ty.relation(name).ok_or_else(|| StoreError::UnknownField {
                entity: ty.name().to_string(),
                field: name.clone(),
            })?;
            let nested = mask.get(name);

            match value {
                RelationValue::One(None) if rel.is_owning() => refs.push((name.clone(), None)),
                RelationValue::One(Some(target)) => {
                    if target.entity_type() != rel.target_name() {
                        return Err(StoreError::TypeMismatch(format!(
                            "Relation {}.{} expects {}, got {}",
                            ty.name(),
                            name,
                            rel.target_name(),
                            target.entity_type()
                        )));
                    }
                    if let Some(nested) = nested {
                        if !target.is_stub() {
                            self.add(target, nested)?;
                        } else if rel.is_owning()
                            && !self.contains(&EntityKey::new(rel.target(), target.id()))
                        {
                            return Err(StoreError::MissingRelation {
                                entity: ty.name().to_string(),
                                relation: name.clone(),
                                target: rel.target_name().to_string(),
                                target_id: target.id().to_string(),
                            });
                        }
                    }
                    if rel.is_owning() {
                        refs.push((name.clone(), Some(target.id().to_string())));
                    }
                }
                RelationValue::Many(items) if !rel.is_owning() => {
                    if let Some(nested) = nested {
                        for item in items.iter().filter(|item| !item.is_stub()) {
                            self.add(item, nested)?;
                        }
                    }
                }
                RelationValue::Many(_) => {
                    return Err(StoreError::TypeMismatch(format!(
                        "Relation {}.{} is single-valued",
                        ty.name(),
                        name
                    )));
                }
                RelationValue::One(None) => {}
            }
        }

        let entry = self.entries.entry(key.clone()).or_default();
        let cached = entry.value.get_or_insert_with(CachedValue::default);
        for (name, value) in entity.fields() {
            cached.fields.insert(name.clone(), value.clone());
        }
        for (name, id) in refs {
            cached.refs.insert(name, id);
        }

        Ok(key)
    }

    pub fn get(&self, key: &EntityKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// True when the identity is cached with a value.
    pub fn exists(&self, key: &EntityKey) -> bool {
        matches!(self.entries.get(key), Some(CacheEntry { value: Some(_) }))
    }

    /// True when the identity has any entry, including a null one.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Marks the identity as known, pending load.
    pub fn ensure(&mut self, key: &EntityKey) {
        if !self.entries.contains_key(key) {
            self.entries.insert(key.clone(), CacheEntry::default());
        }
    }

    /// Records that the identity does not exist.
    pub fn delete(&mut self, key: &EntityKey) {
        self.entries.insert(key.clone(), CacheEntry::default());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones the cached value, following `mask` through further lookups.
    pub fn materialize(&self, key: &EntityKey, mask: &RelationMask) -> Materialized {
        let Some(entry) = self.entries.get(key) else {
            return Materialized::Indeterminate;
        };
        let Some(value) = &entry.value else {
            return Materialized::Missing;
        };

        let ty = self.schema.get(key.entity);
        if ty
            .columns()
            .iter()
            .any(|column| !value.fields.contains_key(&column.name))
        {
            return Materialized::Indeterminate;
        }

        let mut entity = Entity::new(ty.name(), key.id.as_str());
        for (name, field) in &value.fields {
            entity.set(name.as_str(), field.clone());
        }

        for rel in ty.owning_relations() {
            if mask.contains(rel.name()) {
                continue;
            }
            if let Some(id) = value.refs.get(rel.name()) {
                let stub = id
                    .as_ref()
                    .map(|id| Entity::stub(rel.target_name(), id.as_str()));
                entity.set_ref(rel.name(), stub);
            }
        }

        for (name, nested) in mask.iter() {
            let Some(rel) = ty.relation(name) else {
                return Materialized::Indeterminate;
            };
            if !rel.is_owning() {
                return Materialized::Indeterminate;
            }
            match value.refs.get(name) {
                None => return Materialized::Indeterminate,
                Some(None) => entity.set_ref(name, None),
                Some(Some(target_id)) => {
                    let target_key = EntityKey::new(rel.target(), target_id.as_str());
                    match self.materialize(&target_key, nested) {
                        Materialized::Found(target) => entity.set_ref(name, Some(target)),
                        Materialized::Missing => entity.set_ref(name, None),
                        Materialized::Indeterminate => return Materialized::Indeterminate,
                    }
                }
            }
        }

        Materialized::Found(entity)
    }

    /// Row image used for writes: fields plus owning foreign keys as stubs.
    pub(crate) fn row(&self, key: &EntityKey) -> Option<Entity> {
        let value = self.entries.get(key)?.value.as_ref()?;
        let ty = self.schema.get(key.entity);

        let mut row = Entity::new(ty.name(), key.id.as_str());
        for (name, field) in &value.fields {
            row.set(name.as_str(), field.clone());
        }
        for rel in ty.owning_relations() {
            if let Some(id) = value.refs.get(rel.name()) {
                let stub = id
                    .as_ref()
                    .map(|id| Entity::stub(rel.target_name(), id.as_str()));
                row.set_ref(rel.name(), stub);
            }
        }
        Some(row)
    }
}
