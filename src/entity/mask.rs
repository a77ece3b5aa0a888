use crate::core::{Result, StoreError};
use std::collections::BTreeMap;

/// Recursive selection of relations.
///
/// A relation mapped to an empty mask is a shallow request (`true`); a
/// non-empty nested mask asks for the relation's own relations as well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationMask {
    relations: BTreeMap<String, RelationMask>,
}

impl RelationMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, relation: impl Into<String>) -> Self {
        self.relations.entry(relation.into()).or_default();
        self
    }

    pub fn with_nested(mut self, relation: impl Into<String>, nested: RelationMask) -> Self {
        self.relations
            .entry(relation.into())
            .or_default()
            .merge(&nested);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn contains(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub fn get(&self, relation: &str) -> Option<&RelationMask> {
        self.relations.get(relation)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RelationMask)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Recursive union with `other`.
    pub fn merge(&mut self, other: &RelationMask) {
        for (name, nested) in &other.relations {
            self.relations.entry(name.clone()).or_default().merge(nested);
        }
    }

    pub fn union(&self, other: &RelationMask) -> RelationMask {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// True when every relation requested by `other` is also requested here.
    pub fn covers(&self, other: &RelationMask) -> bool {
        other.relations.iter().all(|(name, nested)| {
            self.relations
                .get(name)
                .is_some_and(|mine| mine.covers(nested))
        })
    }

    /// Parses `{"author": true, "posts": {"author": true}}`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(StoreError::InvalidUsage(format!(
                "relation mask must be a JSON object, got {}",
                value
            )));
        };

        let mut mask = RelationMask::new();
        for (name, entry) in map {
            match entry {
                serde_json::Value::Bool(true) => mask = mask.with(name.clone()),
                serde_json::Value::Bool(false) => {}
                serde_json::Value::Object(_) => {
                    mask = mask.with_nested(name.clone(), Self::from_json(entry)?)
                }
                other => {
                    return Err(StoreError::InvalidUsage(format!(
                        "relation mask entry '{}' must be a boolean or an object, got {}",
                        name, other
                    )));
                }
            }
        }
        Ok(mask)
    }
}
