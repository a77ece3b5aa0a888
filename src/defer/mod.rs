// ============================================================================
// Deferred Load Queue
// ============================================================================
//
// Collects point lookups (entity type, id, relation mask) without I/O and
// resolves them later with as few batched fetches as the batch size allows.
// Ids that come back empty are cached as null so they are never re-queried.
// Identities with a pending change keep their staged cache entry.
//
// ============================================================================

use crate::cache::{EntityCache, Materialized};
use crate::core::Result;
use crate::entity::{Entity, EntityKey, RelationMask};
use crate::schema::EntityTypeId;
use crate::tracker::ChangeTracker;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tracing::{Level, event};

/// Source of batched rows for the queue.
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    /// Fetches the rows of `entity` with the given ids, with `mask` loaded.
    async fn fetch(
        &self,
        entity: EntityTypeId,
        ids: &[String],
        mask: &RelationMask,
    ) -> Result<Vec<Entity>>;
}

#[derive(Debug, Default)]
pub struct DeferQueue {
    pending: BTreeMap<EntityTypeId, BTreeMap<String, RelationMask>>,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`, merging `mask` with earlier requests.
    pub fn add(&mut self, key: &EntityKey, mask: &RelationMask) {
        self.pending
            .entry(key.entity)
            .or_default()
            .entry(key.id.clone())
            .or_default()
            .merge(mask);
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.pending
            .get(&key.entity)
            .is_some_and(|ids| ids.contains_key(&key.id))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(|ids| ids.len()).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Loads every pending id into `cache`.
    ///
    /// Returns the number of fetch calls issued. On failure the ids of the
    /// failed batch and of every batch not yet attempted stay queued.
    pub async fn resolve<F>(
        &mut self,
        cache: &mut EntityCache,
        tracker: &ChangeTracker,
        fetcher: &F,
        batch_size: usize,
    ) -> Result<usize>
    where
        F: BatchFetcher + ?Sized,
    {
        let batch_size = batch_size.max(1);
        let mut fetches = 0;
        let entities: Vec<EntityTypeId> = self.pending.keys().copied().collect();

        for entity in entities {
            let Some(requests) = self.pending.get(&entity) else {
                continue;
            };
            let wanted: Vec<(String, RelationMask)> = requests
                .iter()
                .filter(|(id, mask)| {
                    let key = EntityKey::new(entity, id.as_str());
                    cache.materialize(&key, mask) == Materialized::Indeterminate
                })
                .map(|(id, mask)| (id.clone(), mask.clone()))
                .collect();

            for chunk in wanted.chunks(batch_size) {
                let mut mask = RelationMask::new();
                for (_, requested) in chunk {
                    mask.merge(requested);
                }
                let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();

                let rows = fetcher.fetch(entity, &ids, &mask).await?;
                fetches += 1;
                event!(
                    Level::DEBUG,
                    entity = %entity,
                    requested = ids.len(),
                    found = rows.len(),
                    "deferred batch loaded"
                );

                let mut found = HashSet::new();
                for row in &rows {
                    found.insert(row.id().to_string());
                    let key = EntityKey::new(entity, row.id());
                    if tracker.get(&key).is_none() {
                        cache.add(row, &mask)?;
                    }
                }
                for id in &ids {
                    let key = EntityKey::new(entity, id.as_str());
                    if !found.contains(id) && tracker.get(&key).is_none() {
                        cache.delete(&key);
                    }
                }

                if let Some(requests) = self.pending.get_mut(&entity) {
                    for id in &ids {
                        requests.remove(id);
                    }
                }
            }

            // everything left was already answerable from the cache
            self.pending.remove(&entity);
        }

        Ok(fetches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, StoreError};
    use crate::schema::{EntityTypeDef, SchemaRegistry};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        existing: HashSet<String>,
    }

    #[async_trait]
    impl BatchFetcher for CountingFetcher {
        async fn fetch(
            &self,
            _entity: EntityTypeId,
            ids: &[String],
            _mask: &RelationMask,
        ) -> Result<Vec<Entity>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_on_call {
                return Err(StoreError::backend("08006", "connection lost"));
            }
            Ok(ids
                .iter()
                .filter(|id| self.existing.contains(*id))
                .map(|id| Entity::new("Token", id.as_str()).with("supply", 1))
                .collect())
        }
    }

    fn fetcher(existing: &[&str], fail_on_call: Option<usize>) -> CountingFetcher {
        CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_on_call,
            existing: existing.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn setup(
        existing: &[&str],
        fail_on_call: Option<usize>,
    ) -> (EntityCache, ChangeTracker, CountingFetcher, EntityTypeId) {
        let schema = Arc::new(
            SchemaRegistry::builder()
                .entity(EntityTypeDef::new("Token").required("supply", DataType::Integer))
                .build()
                .unwrap(),
        );
        let id = schema.resolve("Token").unwrap().id();
        (
            EntityCache::new(schema.clone()),
            ChangeTracker::new(schema),
            fetcher(existing, fail_on_call),
            id,
        )
    }

    #[tokio::test]
    async fn test_batches_are_ceil_n_over_k() {
        for (n, k) in [(10usize, 3usize), (9, 3), (1, 5), (7, 1)] {
            let (mut cache, tracker, fetcher, ty) = setup(&["t0", "t2", "t4"], None);
            let mut queue = DeferQueue::new();
            for i in 0..n {
                queue.add(&EntityKey::new(ty, format!("t{}", i)), &RelationMask::new());
            }

            let fetches = queue.resolve(&mut cache, &tracker, &fetcher, k).await.unwrap();
            assert_eq!(fetches, n.div_ceil(k));
            assert_eq!(fetcher.calls.load(Ordering::SeqCst), n.div_ceil(k));
            assert!(queue.is_empty());
            for i in 0..n {
                assert!(cache.contains(&EntityKey::new(ty, format!("t{}", i))));
            }
        }
    }

    #[tokio::test]
    async fn test_missing_ids_are_not_requeried() {
        let (mut cache, tracker, fetcher, ty) = setup(&["t0"], None);
        let mut queue = DeferQueue::new();
        let missing = EntityKey::new(ty, "t9");

        queue.add(&missing, &RelationMask::new());
        queue.resolve(&mut cache, &tracker, &fetcher, 10).await.unwrap();
        assert_eq!(cache.materialize(&missing, &RelationMask::new()), Materialized::Missing);

        queue.add(&missing, &RelationMask::new());
        let fetches = queue.resolve(&mut cache, &tracker, &fetcher, 10).await.unwrap();
        assert_eq!(fetches, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_stays_queued() {
        let (mut cache, tracker, fetcher, ty) = setup(&["t0", "t1", "t2", "t3"], Some(1));
        let mut queue = DeferQueue::new();
        for i in 0..4 {
            queue.add(&EntityKey::new(ty, format!("t{}", i)), &RelationMask::new());
        }

        assert!(queue.resolve(&mut cache, &tracker, &fetcher, 2).await.is_err());
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains(&EntityKey::new(ty, "t0")));
        assert!(queue.contains(&EntityKey::new(ty, "t2")));

        // retry picks up where it failed
        let fetches = queue.resolve(&mut cache, &tracker, &fetcher, 2).await.unwrap();
        assert_eq!(fetches, 1);
        assert!(queue.is_empty());
        assert!(cache.exists(&EntityKey::new(ty, "t3")));
    }

    #[tokio::test]
    async fn test_staged_writes_survive_resolution() {
        let schema = Arc::new(
            SchemaRegistry::builder()
                .entity(
                    EntityTypeDef::new("Token")
                        .required("supply", DataType::Integer)
                        .column("label", DataType::Text),
                )
                .build()
                .unwrap(),
        );
        let mut cache = EntityCache::new(schema.clone());
        let mut tracker = ChangeTracker::new(schema);
        let fetcher = fetcher(&["t1"], None);

        // 1. t1 is staged over its stored row, t7 is a new insert
        let t1 = cache
            .add(&Entity::new("Token", "t1").with("supply", 5), &RelationMask::new())
            .unwrap();
        tracker.upsert(&t1);
        let t7 = cache
            .add(&Entity::new("Token", "t7").with("supply", 7), &RelationMask::new())
            .unwrap();
        tracker.insert(&t7).unwrap();

        // 2. Both are queued; the missing label makes the cache unable to answer
        let mut queue = DeferQueue::new();
        queue.add(&t1, &RelationMask::new());
        queue.add(&t7, &RelationMask::new());
        let fetches = queue.resolve(&mut cache, &tracker, &fetcher, 10).await.unwrap();
        assert_eq!(fetches, 1);
        assert!(queue.is_empty());

        // 3. Neither the stored row nor its absence replaced the staged values
        let supply = |key: &EntityKey| {
            cache
                .get(key)
                .and_then(|entry| entry.value.as_ref())
                .and_then(|value| value.field("supply").cloned())
        };
        assert_eq!(supply(&t1), Some(crate::core::Value::Integer(5)));
        assert_eq!(supply(&t7), Some(crate::core::Value::Integer(7)));
    }

    #[test]
    fn test_masks_merge_per_identity() {
        let mut queue = DeferQueue::new();
        let key = EntityKey::new(crate::schema::EntityTypeId(0), "x");
        queue.add(&key, &RelationMask::new().with("a"));
        queue.add(&key, &RelationMask::new().with("b"));
        assert_eq!(queue.len(), 1);
        let mask = &queue.pending[&key.entity][&key.id];
        assert!(mask.contains("a") && mask.contains("b"));
    }
}
