// ============================================================================
// Change Tracking
// ============================================================================
//
// One pending record per entity identity. Transitions:
//
//   current  | insert()         | upsert() | delete()
//   ---------+------------------+----------+---------------
//   none     | Insert           | Upsert   | Delete
//   Insert   | error            | Insert   | record removed
//   Upsert   | error            | Upsert   | Delete
//   Delete   | Upsert           | Upsert   | Delete
//
// Insert followed by Delete never reaches the database. Delete followed by
// Insert is a resurrection and is written as Upsert, because the row may
// still physically exist when a transaction is retried.
//
// ============================================================================

use crate::core::{Result, StoreError};
use crate::entity::EntityKey;
use crate::schema::{EntityTypeId, SchemaRegistry};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Upsert,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Upsert => write!(f, "UPSERT"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    seq: u64,
    kind: ChangeKind,
}

pub struct ChangeTracker {
    schema: Arc<SchemaRegistry>,
    records: HashMap<EntityKey, Record>,
    next_seq: u64,
}

impl ChangeTracker {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            records: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, key: &EntityKey) -> Result<ChangeKind> {
        let next = match self.get(key) {
            None => ChangeKind::Insert,
            Some(ChangeKind::Insert | ChangeKind::Upsert) => {
                return Err(StoreError::DuplicateInsert {
                    entity: self.schema.get(key.entity).name().to_string(),
                    id: key.id.clone(),
                });
            }
            Some(ChangeKind::Delete) => ChangeKind::Upsert,
        };
        self.set(key, next);
        Ok(next)
    }

    pub fn upsert(&mut self, key: &EntityKey) -> ChangeKind {
        let next = match self.get(key) {
            Some(ChangeKind::Insert) => ChangeKind::Insert,
            _ => ChangeKind::Upsert,
        };
        self.set(key, next);
        next
    }

    /// Returns the resulting record, `None` when a pending insert was cancelled.
    pub fn delete(&mut self, key: &EntityKey) -> Option<ChangeKind> {
        match self.get(key) {
            Some(ChangeKind::Insert) => {
                self.records.remove(key);
                None
            }
            _ => {
                self.set(key, ChangeKind::Delete);
                Some(ChangeKind::Delete)
            }
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<ChangeKind> {
        self.records.get(key).map(|r| r.kind)
    }

    /// True when the identity is about to be written (insert or upsert).
    pub fn is_pending_write(&self, key: &EntityKey) -> bool {
        matches!(self.get(key), Some(ChangeKind::Insert | ChangeKind::Upsert))
    }

    /// Pending records of one entity type in the order they were first made.
    pub fn changes_for(&self, entity: EntityTypeId) -> Vec<(EntityKey, ChangeKind)> {
        let mut changes: Vec<_> = self
            .records
            .iter()
            .filter(|(key, _)| key.entity == entity)
            .map(|(key, record)| (record.seq, key.clone(), record.kind))
            .collect();
        changes.sort_by_key(|(seq, _, _)| *seq);
        changes
            .into_iter()
            .map(|(_, key, kind)| (key, kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn set(&mut self, key: &EntityKey, kind: ChangeKind) {
        match self.records.get_mut(key) {
            Some(record) => record.kind = kind,
            None => {
                self.records.insert(
                    key.clone(),
                    Record {
                        seq: self.next_seq,
                        kind,
                    },
                );
                self.next_seq += 1;
            }
        }
    }
}
