// ============================================================================
// In-Memory Backend
// ============================================================================
//
// Reference `PersistenceBackend` used by tests and embedders. Committed state
// is a persistent (im) structure; each transaction works on its own cheap
// copy and publishes it on commit.
//
// Concurrency control is first-committer-wins: a transaction that wrote
// anything fails with a serialization failure when another transaction
// committed after it began. Every isolation level behaves as SERIALIZABLE.
//
// Constraint checks mirror the relational engine:
//   23505  duplicate primary key / hot block / change log index
//   23502  NULL in a non-nullable column or relation
//   23503  foreign key points nowhere, or a delete is still referenced
//
// ============================================================================

use super::query::{Direction, Filter, FindQuery, field_value};
use super::{BackendTransaction, ChangeLogEntry, IsolationLevel, PersistenceBackend};
use crate::chain::{BlockRef, ChainStatus};
use crate::core::{Result, StoreError, Value};
use crate::entity::Entity;
use crate::schema::{EntityType, EntityTypeId, SchemaRegistry};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Level, event};

/// Write statement observed by the backend, committed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Insert { entity: String, ids: Vec<String> },
    Upsert { entity: String, ids: Vec<String> },
    Delete { entity: String, ids: Vec<String> },
}

impl JournalEntry {
    pub fn entity(&self) -> &str {
        match self {
            Self::Insert { entity, .. }
            | Self::Upsert { entity, .. }
            | Self::Delete { entity, .. } => entity,
        }
    }

    pub fn ids(&self) -> &[String] {
        match self {
            Self::Insert { ids, .. } | Self::Upsert { ids, .. } | Self::Delete { ids, .. } => ids,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: im::HashMap<EntityTypeId, im::OrdMap<String, Entity>>,
    status: Option<ChainStatus>,
    hot_blocks: im::OrdMap<i64, String>,
    change_log: im::OrdMap<(i64, u64), serde_json::Value>,
}

#[derive(Debug, Default)]
struct Committed {
    state: MemoryState,
    version: u64,
}

#[derive(Debug, Default)]
struct Stats {
    journal: Mutex<Vec<JournalEntry>>,
    finds: Mutex<HashMap<String, usize>>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    schema: Arc<SchemaRegistry>,
    committed: Arc<AsyncMutex<Committed>>,
    stats: Arc<Stats>,
}

impl MemoryBackend {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            committed: Arc::new(AsyncMutex::new(Committed::default())),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Write statements issued so far, in order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.stats
            .journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.stats.journal.lock() {
            journal.clear();
        }
    }

    /// Number of `find` calls issued against `entity`.
    pub fn find_calls(&self, entity: &str) -> usize {
        self.stats
            .finds
            .lock()
            .map(|finds| finds.get(entity).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_find_calls(&self) -> usize {
        self.stats
            .finds
            .lock()
            .map(|finds| finds.values().sum())
            .unwrap_or(0)
    }

    /// Committed rows of `entity` ordered by id.
    pub async fn rows(&self, entity: &str) -> Result<Vec<Entity>> {
        let ty = self.schema.resolve(entity)?;
        let committed = self.committed.lock().await;
        Ok(committed
            .state
            .tables
            .get(&ty.id())
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn row(&self, entity: &str, id: &str) -> Result<Option<Entity>> {
        let ty = self.schema.resolve(entity)?;
        let committed = self.committed.lock().await;
        Ok(committed
            .state
            .tables
            .get(&ty.id())
            .and_then(|table| table.get(id).cloned()))
    }

    pub async fn status(&self) -> Option<ChainStatus> {
        self.committed.lock().await.state.status.clone()
    }

    pub async fn committed_hot_blocks(&self) -> Vec<BlockRef> {
        let committed = self.committed.lock().await;
        committed
            .state
            .hot_blocks
            .iter()
            .map(|(height, hash)| BlockRef::new(*height, hash.clone()))
            .collect()
    }

    pub async fn change_log_len(&self) -> usize {
        self.committed.lock().await.state.change_log.len()
    }

    /// Bumps the committed version as if a foreign process had committed.
    ///
    /// Transactions already open will fail to commit any writes.
    pub async fn simulate_concurrent_commit(&self) {
        self.committed.lock().await.version += 1;
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Arc<dyn BackendTransaction>> {
        let committed = self.committed.lock().await;
        event!(Level::TRACE, %isolation, version = committed.version, "memory transaction started");
        Ok(Arc::new(MemoryTransaction {
            schema: Arc::clone(&self.schema),
            committed: Arc::clone(&self.committed),
            stats: Arc::clone(&self.stats),
            base_version: committed.version,
            state: Mutex::new(committed.state.clone()),
            dirty: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryTransaction {
    schema: Arc<SchemaRegistry>,
    committed: Arc<AsyncMutex<Committed>>,
    stats: Arc<Stats>,
    base_version: u64,
    state: Mutex<MemoryState>,
    dirty: AtomicBool,
    finished: AtomicBool,
}

impl MemoryTransaction {
    fn check_open(&self) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidUsage(
                "transaction is already finished".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&self, entry: JournalEntry) -> Result<()> {
        self.stats.journal.lock()?.push(entry);
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Builds the stored image of `row`, merging over `base` when updating.
    fn normalize(
        &self,
        state: &MemoryState,
        ty: &EntityType,
        base: Option<&Entity>,
        row: &Entity,
    ) -> Result<Entity> {
        for name in row.fields().keys() {
            if ty.column(name).is_none() {
                return Err(StoreError::UnknownField {
                    entity: ty.name().to_string(),
                    field: name.clone(),
                });
            }
        }

        let mut stored = Entity::new(ty.name(), row.id());
        for column in ty.columns() {
            let value = row
                .field(&column.name)
                .or_else(|| base.and_then(|b| b.field(&column.name)))
                .cloned()
                .unwrap_or(Value::Null);
            if value.is_null() && !column.nullable {
                return Err(StoreError::backend(
                    "23502",
                    format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        column.name,
                        ty.name()
                    ),
                ));
            }
            column.validate(&value)?;
            stored.set(column.name.as_str(), value);
        }

        for rel in ty.owning_relations() {
            let target = match row.ref_id(rel.name()) {
                Some(id) => id.map(str::to_string),
                None => base
                    .and_then(|b| b.ref_id(rel.name()))
                    .flatten()
                    .map(str::to_string),
            };
            match &target {
                None if !rel.is_nullable() => {
                    return Err(StoreError::backend(
                        "23502",
                        format!(
                            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                            rel.name(),
                            ty.name()
                        ),
                    ));
                }
                Some(id) => {
                    // a self reference may point at the row being written
                    let self_ref = rel.target() == ty.id() && id == row.id();
                    let exists = state
                        .tables
                        .get(&rel.target())
                        .is_some_and(|table| table.contains_key(id));
                    if !exists && !self_ref {
                        return Err(StoreError::backend(
                            "23503",
                            format!(
                                "insert or update on \"{}\" violates foreign key \"{}\": {} {} is not present",
                                ty.name(),
                                rel.name(),
                                rel.target_name(),
                                id
                            ),
                        ));
                    }
                }
                None => {}
            }
            stored.set_ref(
                rel.name(),
                target.map(|id| Entity::stub(rel.target_name(), id)),
            );
        }

        Ok(stored)
    }

    fn select(
        &self,
        state: &MemoryState,
        ty: &EntityType,
        filters: &[Filter],
    ) -> Result<Vec<Entity>> {
        let mut rows = Vec::new();
        let Some(table) = state.tables.get(&ty.id()) else {
            return Ok(rows);
        };
        for row in table.values() {
            let mut keep = true;
            for filter in filters {
                if !filter.matches(&field_value(ty, row, filter.field())?) {
                    keep = false;
                    break;
                }
            }
            if keep {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }
}

fn drop_change_log(state: &mut MemoryState, doomed: impl Fn(i64) -> bool) {
    let keys: Vec<(i64, u64)> = state
        .change_log
        .keys()
        .filter(|(height, _)| doomed(*height))
        .copied()
        .collect();
    for key in keys {
        state.change_log.remove(&key);
    }
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    async fn insert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()> {
        self.check_open()?;
        self.record(JournalEntry::Insert {
            entity: entity.name().to_string(),
            ids: rows.iter().map(|r| r.id().to_string()).collect(),
        })?;

        let mut state = self.state.lock()?;
        let mut next = state.clone();
        for row in rows {
            let exists = next
                .tables
                .get(&entity.id())
                .is_some_and(|table| table.contains_key(row.id()));
            if exists {
                return Err(StoreError::backend(
                    "23505",
                    format!(
                        "duplicate key value violates unique constraint \"{}_pkey\": {}",
                        entity.name(),
                        row.id()
                    ),
                ));
            }
            let stored = self.normalize(&next, entity, None, row)?;
            next.tables
                .entry(entity.id())
                .or_insert_with(im::OrdMap::new)
                .insert(row.id().to_string(), stored);
        }
        *state = next;
        self.mark_dirty();
        Ok(())
    }

    async fn upsert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()> {
        self.check_open()?;
        self.record(JournalEntry::Upsert {
            entity: entity.name().to_string(),
            ids: rows.iter().map(|r| r.id().to_string()).collect(),
        })?;

        let mut state = self.state.lock()?;
        let mut next = state.clone();
        for row in rows {
            let base = next
                .tables
                .get(&entity.id())
                .and_then(|table| table.get(row.id()).cloned());
            let stored = self.normalize(&next, entity, base.as_ref(), row)?;
            next.tables
                .entry(entity.id())
                .or_insert_with(im::OrdMap::new)
                .insert(row.id().to_string(), stored);
        }
        *state = next;
        self.mark_dirty();
        Ok(())
    }

    async fn delete(&self, entity: &EntityType, ids: &[String]) -> Result<()> {
        self.check_open()?;
        self.record(JournalEntry::Delete {
            entity: entity.name().to_string(),
            ids: ids.to_vec(),
        })?;

        let mut state = self.state.lock()?;
        let mut next = state.clone();
        if let Some(table) = next.tables.get_mut(&entity.id()) {
            for id in ids {
                table.remove(id);
            }
        }

        // statement-level restrict
        let removed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        for ty in self.schema.types() {
            let Some(table) = next.tables.get(&ty.id()) else {
                continue;
            };
            for rel in ty.owning_relations().filter(|r| r.target() == entity.id()) {
                for row in table.values() {
                    if let Some(Some(target)) = row.ref_id(rel.name()) {
                        if removed.contains(target) {
                            return Err(StoreError::backend(
                                "23503",
                                format!(
                                    "delete on \"{}\" violates foreign key \"{}.{}\": {} {} is still referenced by {}",
                                    entity.name(),
                                    ty.name(),
                                    rel.name(),
                                    entity.name(),
                                    target,
                                    row.id()
                                ),
                            ));
                        }
                    }
                }
            }
        }

        *state = next;
        self.mark_dirty();
        Ok(())
    }

    async fn find(&self, entity: &EntityType, query: &FindQuery) -> Result<Vec<Entity>> {
        self.check_open()?;
        *self
            .stats
            .finds
            .lock()?
            .entry(entity.name().to_string())
            .or_default() += 1;

        let state = self.state.lock()?;
        let mut rows = self.select(&state, entity, &query.filters)?;

        if !query.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let mut keys = Vec::with_capacity(query.order_by.len());
                for order in &query.order_by {
                    keys.push(field_value(entity, &row, &order.field)?);
                }
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for (i, order) in query.order_by.iter().enumerate() {
                    let ord = a[i].compare(&b[i]).unwrap_or(CmpOrdering::Equal);
                    let ord = match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    };
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
                CmpOrdering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        let skip = query.skip.unwrap_or(0);
        let take = query.take.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(skip).take(take).collect())
    }

    async fn count(&self, entity: &EntityType, filters: &[Filter]) -> Result<usize> {
        self.check_open()?;
        let state = self.state.lock()?;
        Ok(self.select(&state, entity, filters)?.len())
    }

    async fn ensure_status(&self) -> Result<ChainStatus> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        if let Some(status) = &state.status {
            return Ok(status.clone());
        }
        let status = ChainStatus::initial();
        state.status = Some(status.clone());
        self.mark_dirty();
        Ok(status)
    }

    async fn hot_blocks(&self) -> Result<Vec<BlockRef>> {
        self.check_open()?;
        let state = self.state.lock()?;
        Ok(state
            .hot_blocks
            .iter()
            .map(|(height, hash)| BlockRef::new(*height, hash.clone()))
            .collect())
    }

    async fn update_status(&self, expected_nonce: i64, head: &BlockRef) -> Result<u64> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        match state.status.as_mut() {
            Some(status) if status.nonce == expected_nonce => {
                status.height = head.height;
                status.hash = head.hash.clone();
                status.nonce += 1;
                self.mark_dirty();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_hot_block(&self, block: &BlockRef) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        if state.hot_blocks.contains_key(&block.height) {
            return Err(StoreError::backend(
                "23505",
                format!("hot block {} already exists", block.height),
            ));
        }
        state.hot_blocks.insert(block.height, block.hash.clone());
        self.mark_dirty();
        Ok(())
    }

    async fn delete_hot_block(&self, height: i64) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        state.hot_blocks.remove(&height);
        drop_change_log(&mut state, |h| h == height);
        self.mark_dirty();
        Ok(())
    }

    async fn delete_hot_blocks(&self, up_to_height: i64) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        let finalized: Vec<i64> = state
            .hot_blocks
            .keys()
            .copied()
            .take_while(|height| *height <= up_to_height)
            .collect();
        for height in finalized {
            state.hot_blocks.remove(&height);
        }
        drop_change_log(&mut state, |h| h <= up_to_height);
        self.mark_dirty();
        Ok(())
    }

    async fn append_change(
        &self,
        block_height: i64,
        index: u64,
        change: &serde_json::Value,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock()?;
        if !state.hot_blocks.contains_key(&block_height) {
            return Err(StoreError::backend(
                "23503",
                format!("hot change refers to unknown hot block {}", block_height),
            ));
        }
        if state.change_log.contains_key(&(block_height, index)) {
            return Err(StoreError::backend(
                "23505",
                format!("hot change {}/{} already exists", block_height, index),
            ));
        }
        state.change_log.insert((block_height, index), change.clone());
        self.mark_dirty();
        Ok(())
    }

    async fn change_log(&self, block_height: i64) -> Result<Vec<ChangeLogEntry>> {
        self.check_open()?;
        let state = self.state.lock()?;
        Ok(state
            .change_log
            .range((block_height, 0)..=(block_height, u64::MAX))
            .map(|((height, index), change)| ChangeLogEntry {
                block_height: *height,
                index: *index,
                change: change.clone(),
            })
            .collect())
    }

    async fn commit(&self) -> Result<()> {
        self.check_open()?;
        let mut committed = self.committed.lock().await;
        self.finished.store(true, Ordering::SeqCst);

        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        if committed.version != self.base_version {
            return Err(StoreError::SerializationFailure(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }
        committed.state = self.state.lock()?.clone();
        committed.version += 1;
        event!(Level::TRACE, version = committed.version, "memory transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}
