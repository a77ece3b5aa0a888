use super::facade::Store;
use crate::core::Result;
use crate::entity::{Entity, RelationMask};

/// Handle returned by [`Store::defer`].
///
/// The lookup is queued when the handle is created; the first read through
/// any handle (or any `get` on the store) resolves the whole queue in
/// batches.
pub struct DeferredEntity<'a> {
    store: &'a Store,
    entity: String,
    id: String,
    mask: RelationMask,
}

impl<'a> DeferredEntity<'a> {
    pub(crate) fn new(store: &'a Store, entity: &str, id: &str, mask: RelationMask) -> Self {
        Self {
            store,
            entity: entity.to_string(),
            id: id.to_string(),
            mask,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get(&self) -> Result<Option<Entity>> {
        self.store.get_with(&self.entity, &self.id, &self.mask).await
    }

    pub async fn get_or_fail(&self) -> Result<Entity> {
        self.store
            .get_or_fail_with(&self.entity, &self.id, &self.mask)
            .await
    }

    pub async fn get_or_insert<F>(&self, factory: F) -> Result<Entity>
    where
        F: FnOnce(&str) -> Entity + Send,
    {
        self.store
            .get_or_insert_with(&self.entity, &self.id, &self.mask, factory)
            .await
    }
}
