use super::commit::{WriteStep, plan_commit};
use super::config::{CacheMode, FlushMode, StoreConfig};
use super::deferred::DeferredEntity;
use super::loader::load_relations;
use crate::backend::{BackendTransaction, Filter, FindQuery, OrderBy};
use crate::cache::{EntityCache, Materialized};
use crate::core::{Result, StoreError, Value};
use crate::defer::{BatchFetcher, DeferQueue};
use crate::entity::{Entity, EntityKey, RelationMask};
use crate::schema::{EntityType, EntityTypeId, SchemaRegistry};
use crate::tracker::ChangeTracker;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

/// Options of a `find` read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filters: Vec<Filter>,
    pub relations: RelationMask,
    pub order_by: Vec<OrderBy>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn relations(mut self, mask: RelationMask) -> Self {
        self.relations = mask;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    fn query(&self) -> FindQuery {
        FindQuery {
            filters: self.filters.clone(),
            order_by: self.order_by.clone(),
            skip: self.skip,
            take: self.take,
        }
    }
}

struct StoreState {
    cache: EntityCache,
    tracker: ChangeTracker,
    defer: DeferQueue,
}

/// Unit-of-work facade over one backend transaction.
///
/// Writes only touch local state; they reach the transaction on `sync`,
/// which every read triggers first (see [`FlushMode`]). A store is closed
/// once the transaction block that created it ends.
pub struct Store {
    schema: Arc<SchemaRegistry>,
    tx: Arc<dyn BackendTransaction>,
    config: StoreConfig,
    state: Mutex<StoreState>,
    sync_lock: Mutex<()>,
    load_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Store {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        tx: Arc<dyn BackendTransaction>,
        config: StoreConfig,
    ) -> Self {
        let state = StoreState {
            cache: EntityCache::new(Arc::clone(&schema)),
            tracker: ChangeTracker::new(Arc::clone(&schema)),
            defer: DeferQueue::new(),
        };
        Self {
            schema,
            tx,
            config,
            state: Mutex::new(state),
            sync_lock: Mutex::new(()),
            load_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        Ok(())
    }

    /// Number of identities with a pending change.
    pub async fn pending_changes(&self) -> usize {
        self.state.lock().await.tracker.len()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stages a new row. Missing columns are written as NULL.
    pub async fn insert(&self, entity: Entity) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock().await;
            let ty = self.schema.resolve(entity.entity_type())?;
            let key = EntityKey::new(ty.id(), entity.id());
            if state.tracker.is_pending_write(&key) {
                return Err(StoreError::DuplicateInsert {
                    entity: ty.name().to_string(),
                    id: key.id,
                });
            }
            let row = row_image(ty, &entity, true)?;
            state.cache.add(&row, &RelationMask::new())?;
            state.tracker.insert(&key)?;
        }
        self.after_write().await
    }

    /// Stages an insert-or-update of the fields present on `entity`.
    pub async fn upsert(&self, entity: Entity) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock().await;
            let ty = self.schema.resolve(entity.entity_type())?;
            let row = row_image(ty, &entity, false)?;
            let key = state.cache.add(&row, &RelationMask::new())?;
            state.tracker.upsert(&key);
        }
        self.after_write().await
    }

    pub async fn delete(&self, entity: &Entity) -> Result<()> {
        self.delete_by_id(entity.entity_type(), entity.id()).await
    }

    pub async fn delete_by_id(&self, entity: &str, id: &str) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock().await;
            let ty = self.schema.resolve(entity)?;
            let key = EntityKey::new(ty.id(), id);
            state.tracker.delete(&key);
            state.cache.delete(&key);
        }
        self.after_write().await
    }

    async fn after_write(&self) -> Result<()> {
        if self.config.flush_mode == FlushMode::Always {
            self.sync().await?;
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, entity: &str, id: &str) -> Result<Option<Entity>> {
        self.get_with(entity, id, &RelationMask::new()).await
    }

    /// Point lookup with the relations named by `mask` loaded.
    pub async fn get_with(
        &self,
        entity: &str,
        id: &str,
        mask: &RelationMask,
    ) -> Result<Option<Entity>> {
        self.check_open()?;
        let ty = self.schema.resolve(entity)?;
        let key = EntityKey::new(ty.id(), id);

        self.before_read().await?;
        self.resolve_deferred().await?;

        match self.state.lock().await.cache.materialize(&key, mask) {
            Materialized::Found(entity) => return Ok(Some(entity)),
            Materialized::Missing => return Ok(None),
            Materialized::Indeterminate => {}
        }

        // the database is about to be read: nothing may stay pending
        self.sync().await?;
        let mut rows = self
            .tx
            .find(ty, &FindQuery::by_ids(&[id.to_string()]))
            .await?;
        load_relations(self.tx.as_ref(), &self.schema, ty, &mut rows, mask).await?;
        let row = rows.into_iter().next();

        if self.config.cache_mode == CacheMode::All {
            let mut state = self.state.lock().await;
            if state.tracker.is_empty() {
                match &row {
                    Some(row) => {
                        state.cache.add(row, mask)?;
                    }
                    None => state.cache.delete(&key),
                }
            }
        }
        Ok(row)
    }

    pub async fn get_or_fail(&self, entity: &str, id: &str) -> Result<Entity> {
        self.get_or_fail_with(entity, id, &RelationMask::new()).await
    }

    pub async fn get_or_fail_with(
        &self,
        entity: &str,
        id: &str,
        mask: &RelationMask,
    ) -> Result<Entity> {
        self.get_with(entity, id, mask)
            .await?
            .ok_or_else(|| StoreError::not_found(entity, id))
    }

    /// Returns the stored row, or inserts the one built by `factory`.
    pub async fn get_or_insert<F>(&self, entity: &str, id: &str, factory: F) -> Result<Entity>
    where
        F: FnOnce(&str) -> Entity + Send,
    {
        self.get_or_insert_with(entity, id, &RelationMask::new(), factory)
            .await
    }

    pub(crate) async fn get_or_insert_with<F>(
        &self,
        entity: &str,
        id: &str,
        mask: &RelationMask,
        factory: F,
    ) -> Result<Entity>
    where
        F: FnOnce(&str) -> Entity + Send,
    {
        if let Some(found) = self.get_with(entity, id, mask).await? {
            return Ok(found);
        }
        let created = factory(id);
        if created.entity_type() != entity || created.id() != id {
            return Err(StoreError::InvalidUsage(format!(
                "get_or_insert({}, {}) factory returned {} {}",
                entity,
                id,
                created.entity_type(),
                created.id()
            )));
        }
        self.insert(created.clone()).await?;
        Ok(created)
    }

    /// Registers a lookup to be resolved together with other deferred ones.
    pub async fn defer(
        &self,
        entity: &str,
        id: &str,
        mask: RelationMask,
    ) -> Result<DeferredEntity<'_>> {
        self.check_open()?;
        let ty = self.schema.resolve(entity)?;
        self.state
            .lock()
            .await
            .defer
            .add(&EntityKey::new(ty.id(), id), &mask);
        Ok(DeferredEntity::new(self, ty.name(), id, mask))
    }

    pub async fn find(&self, entity: &str, options: &FindOptions) -> Result<Vec<Entity>> {
        self.check_open()?;
        let ty = self.schema.resolve(entity)?;

        self.before_read().await?;
        self.sync().await?;
        let mut rows = self.tx.find(ty, &options.query()).await?;
        load_relations(self.tx.as_ref(), &self.schema, ty, &mut rows, &options.relations).await?;

        if self.config.cache_mode == CacheMode::All {
            let mut state = self.state.lock().await;
            if state.tracker.is_empty() {
                for row in &rows {
                    state.cache.add(row, &options.relations)?;
                }
            }
        }
        Ok(rows)
    }

    pub async fn find_one(&self, entity: &str, options: &FindOptions) -> Result<Option<Entity>> {
        let options = FindOptions {
            take: Some(1),
            ..options.clone()
        };
        Ok(self.find(entity, &options).await?.into_iter().next())
    }

    pub async fn find_one_or_fail(&self, entity: &str, options: &FindOptions) -> Result<Entity> {
        self.find_one(entity, options).await?.ok_or_else(|| {
            let id = options
                .filters
                .iter()
                .find_map(|filter| match filter {
                    Filter::Eq(field, Value::Text(id)) if field == "id" => Some(id.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| format!("matching {:?}", options.filters));
            StoreError::not_found(entity, id)
        })
    }

    pub async fn count(&self, entity: &str, filters: &[Filter]) -> Result<usize> {
        self.check_open()?;
        let ty = self.schema.resolve(entity)?;
        self.before_read().await?;
        self.sync().await?;
        self.tx.count(ty, filters).await
    }

    async fn before_read(&self) -> Result<()> {
        if self.config.flush_mode != FlushMode::Batch {
            self.sync().await?;
        }
        Ok(())
    }

    async fn resolve_deferred(&self) -> Result<()> {
        let _load = self.load_lock.lock().await;
        if self.state.lock().await.defer.is_empty() {
            return Ok(());
        }
        self.sync().await?;

        let mut state = self.state.lock().await;
        let StoreState {
            cache,
            tracker,
            defer,
        } = &mut *state;
        let fetcher = BackendFetcher {
            tx: self.tx.as_ref(),
            schema: &self.schema,
        };
        defer
            .resolve(cache, tracker, &fetcher, self.config.defer_batch_size)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Sync / flush
    // ========================================================================

    /// Writes every pending change to the transaction in commit order.
    pub async fn sync(&self) -> Result<()> {
        self.check_open()?;
        let _sync = self.sync_lock.lock().await;
        let mut state = self.state.lock().await;
        if state.tracker.is_empty() {
            return Ok(());
        }

        let span = info_span!("sync", changes = state.tracker.len());
        async {
            let plan = plan_commit(
                &self.schema,
                &state.cache,
                &state.tracker,
                self.config.write_batch_size,
            )?;
            for step in plan.into_steps() {
                let ty = self.schema.get(step.entity());
                event!(
                    Level::DEBUG,
                    entity = %ty.name(),
                    rows = step.len(),
                    step = step_name(&step),
                    "commit step"
                );
                match step {
                    WriteStep::Insert { rows, .. } => self.tx.insert(ty, &rows).await?,
                    WriteStep::Upsert { rows, .. } => self.tx.upsert(ty, &rows).await?,
                    WriteStep::Delete { ids, .. } => self.tx.delete(ty, &ids).await?,
                }
            }
            state.tracker.clear();
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// `sync` followed by a reset of the cache, the change set and the
    /// deferred queue.
    pub async fn flush(&self) -> Result<()> {
        self.sync().await?;
        let mut state = self.state.lock().await;
        state.cache.clear();
        state.tracker.clear();
        state.defer.clear();
        Ok(())
    }
}

fn step_name(step: &WriteStep) -> &'static str {
    match step {
        WriteStep::Insert { .. } => "insert",
        WriteStep::Upsert { .. } => "upsert",
        WriteStep::Delete { .. } => "delete",
    }
}

/// Row image of a write: unknown names rejected, inverse sides dropped.
///
/// A full image fills every column and owning relation, absent ones as NULL.
fn row_image(ty: &EntityType, entity: &Entity, full: bool) -> Result<Entity> {
    for name in entity.fields().keys() {
        if ty.column(name).is_none() {
            return Err(unknown_field(ty, name));
        }
    }
    for name in entity.relations().keys() {
        if ty.relation(name).is_none() {
            return Err(unknown_field(ty, name));
        }
    }

    let mut row = Entity::new(ty.name(), entity.id());
    for column in ty.columns() {
        match entity.field(&column.name) {
            Some(value) => row.set(column.name.as_str(), value.clone()),
            None if full => row.set(column.name.as_str(), Value::Null),
            None => {}
        }
    }
    for rel in ty.owning_relations() {
        match entity.ref_id(rel.name()) {
            Some(target) => row.set_ref(
                rel.name(),
                target.map(|id| Entity::stub(rel.target_name(), id)),
            ),
            None if full => row.set_ref(rel.name(), None),
            None => {}
        }
    }
    Ok(row)
}

fn unknown_field(ty: &EntityType, name: &str) -> StoreError {
    StoreError::UnknownField {
        entity: ty.name().to_string(),
        field: name.to_string(),
    }
}

struct BackendFetcher<'a> {
    tx: &'a dyn BackendTransaction,
    schema: &'a SchemaRegistry,
}

#[async_trait]
impl BatchFetcher for BackendFetcher<'_> {
    async fn fetch(
        &self,
        entity: EntityTypeId,
        ids: &[String],
        mask: &RelationMask,
    ) -> Result<Vec<Entity>> {
        let ty = self.schema.get(entity);
        let mut rows = self.tx.find(ty, &FindQuery::by_ids(ids)).await?;
        load_relations(self.tx, self.schema, ty, &mut rows, mask).await?;
        Ok(rows)
    }
}
