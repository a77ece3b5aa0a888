// ============================================================================
// Hot Block Change Log
// ============================================================================
//
// While a hot block is written, every row write is preceded by an undo record
// in `hot_change`:
//
//   insert          -> Insert { id }       undone by delete
//   upsert existing -> Update { old row }  undone by upsert of the old row
//   upsert new      -> Insert { id }
//   delete          -> Delete { old row }  undone by insert of the old row
//
// Rolling a block back replays its log in reverse, then drops the block.
// Old rows are logged with tagged values (floats by bit pattern) so a JSON
// string or a NaN comes back as the same value.
//
// ============================================================================

use super::state::{BlockRef, ChainStatus};
use crate::backend::{BackendTransaction, ChangeLogEntry, Filter, FindQuery};
use crate::core::{Result, StoreError, Value};
use crate::entity::{Entity, RelationValue};
use crate::schema::{EntityType, SchemaRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoggedChange {
    Insert { entity: String, id: String },
    Update { entity: String, row: LoggedRow },
    Delete { entity: String, row: LoggedRow },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Text(String),
    Json(serde_json::Value),
}

impl From<&Value> for LoggedValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Boolean(b) => Self::Boolean(*b),
            Value::Integer(i) => Self::Integer(*i),
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Json(v) => Self::Json(v.clone()),
        }
    }
}

impl From<LoggedValue> for Value {
    fn from(value: LoggedValue) -> Self {
        match value {
            LoggedValue::Null => Value::Null,
            LoggedValue::Boolean(b) => Value::Boolean(b),
            LoggedValue::Integer(i) => Value::Integer(i),
            LoggedValue::Float(bits) => Value::Float(f64::from_bits(bits)),
            LoggedValue::Text(s) => Value::Text(s),
            LoggedValue::Json(v) => Value::Json(v),
        }
    }
}

/// A stored row: its columns and the ids its owning references point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedRow {
    id: String,
    #[serde(default)]
    fields: BTreeMap<String, LoggedValue>,
    #[serde(default)]
    refs: BTreeMap<String, Option<String>>,
}

impl LoggedRow {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn into_entity(self, ty: &EntityType) -> Result<Entity> {
        let mut row = Entity::new(ty.name(), self.id);
        for (name, value) in self.fields {
            row.set(name, Value::from(value));
        }
        for (name, target) in self.refs {
            let rel = ty.relation(&name).ok_or_else(|| StoreError::UnknownField {
                entity: ty.name().to_string(),
                field: name.clone(),
            })?;
            row.set_ref(name, target.map(|id| Entity::stub(rel.target_name(), id)));
        }
        Ok(row)
    }
}

impl From<&Entity> for LoggedRow {
    fn from(row: &Entity) -> Self {
        let fields = row
            .fields()
            .iter()
            .map(|(name, value)| (name.clone(), LoggedValue::from(value)))
            .collect();
        let refs = row
            .relations()
            .iter()
            .filter_map(|(name, value)| match value {
                RelationValue::One(target) => {
                    Some((name.clone(), target.as_deref().map(|e| e.id().to_string())))
                }
                RelationValue::Many(_) => None,
            })
            .collect();
        Self {
            id: row.id().to_string(),
            fields,
            refs,
        }
    }
}

/// Transaction decorator that journals undo records for one hot block.
pub struct HotChangeRecorder {
    inner: Arc<dyn BackendTransaction>,
    block_height: i64,
    next_index: AtomicU64,
}

impl HotChangeRecorder {
    pub fn new(inner: Arc<dyn BackendTransaction>, block_height: i64) -> Self {
        Self {
            inner,
            block_height,
            next_index: AtomicU64::new(0),
        }
    }

    pub fn block_height(&self) -> i64 {
        self.block_height
    }

    async fn log(&self, change: &LoggedChange) -> Result<()> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let change = serde_json::to_value(change)?;
        self.inner
            .append_change(self.block_height, index, &change)
            .await
    }

    async fn existing(
        &self,
        entity: &EntityType,
        ids: &[String],
    ) -> Result<HashMap<String, Entity>> {
        let rows = self.inner.find(entity, &FindQuery::by_ids(ids)).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.id().to_string(), row))
            .collect())
    }
}

#[async_trait]
impl BackendTransaction for HotChangeRecorder {
    async fn insert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()> {
        for row in rows {
            self.log(&LoggedChange::Insert {
                entity: entity.name().to_string(),
                id: row.id().to_string(),
            })
            .await?;
        }
        self.inner.insert(entity, rows).await
    }

    async fn upsert(&self, entity: &EntityType, rows: &[Entity]) -> Result<()> {
        let ids: Vec<String> = rows.iter().map(|row| row.id().to_string()).collect();
        let mut existing = self.existing(entity, &ids).await?;
        for row in rows {
            let change = match existing.remove(row.id()) {
                Some(old) => LoggedChange::Update {
                    entity: entity.name().to_string(),
                    row: LoggedRow::from(&old),
                },
                None => LoggedChange::Insert {
                    entity: entity.name().to_string(),
                    id: row.id().to_string(),
                },
            };
            self.log(&change).await?;
        }
        self.inner.upsert(entity, rows).await
    }

    async fn delete(&self, entity: &EntityType, ids: &[String]) -> Result<()> {
        let mut existing = self.existing(entity, ids).await?;
        for id in ids {
            if let Some(old) = existing.remove(id) {
                self.log(&LoggedChange::Delete {
                    entity: entity.name().to_string(),
                    row: LoggedRow::from(&old),
                })
                .await?;
            }
        }
        self.inner.delete(entity, ids).await
    }

    async fn find(&self, entity: &EntityType, query: &FindQuery) -> Result<Vec<Entity>> {
        self.inner.find(entity, query).await
    }

    async fn count(&self, entity: &EntityType, filters: &[Filter]) -> Result<usize> {
        self.inner.count(entity, filters).await
    }

    async fn ensure_status(&self) -> Result<ChainStatus> {
        self.inner.ensure_status().await
    }

    async fn hot_blocks(&self) -> Result<Vec<BlockRef>> {
        self.inner.hot_blocks().await
    }

    async fn update_status(&self, expected_nonce: i64, head: &BlockRef) -> Result<u64> {
        self.inner.update_status(expected_nonce, head).await
    }

    async fn insert_hot_block(&self, block: &BlockRef) -> Result<()> {
        self.inner.insert_hot_block(block).await
    }

    async fn delete_hot_block(&self, height: i64) -> Result<()> {
        self.inner.delete_hot_block(height).await
    }

    async fn delete_hot_blocks(&self, up_to_height: i64) -> Result<()> {
        self.inner.delete_hot_blocks(up_to_height).await
    }

    async fn append_change(
        &self,
        block_height: i64,
        index: u64,
        change: &serde_json::Value,
    ) -> Result<()> {
        self.inner.append_change(block_height, index, change).await
    }

    async fn change_log(&self, block_height: i64) -> Result<Vec<ChangeLogEntry>> {
        self.inner.change_log(block_height).await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }
}

/// Undoes every change of `block` and removes it from the hot block table.
pub(crate) async fn rollback_block(
    tx: &dyn BackendTransaction,
    schema: &SchemaRegistry,
    block: &BlockRef,
) -> Result<()> {
    let span = info_span!("rollback_block", height = block.height, hash = %block.hash);
    async {
        let log = tx.change_log(block.height).await?;
        for entry in log.iter().rev() {
            let change: LoggedChange = serde_json::from_value(entry.change.clone())?;
            match change {
                LoggedChange::Insert { entity, id } => {
                    tx.delete(schema.resolve(&entity)?, &[id]).await?;
                }
                LoggedChange::Update { entity, row } => {
                    let ty = schema.resolve(&entity)?;
                    tx.upsert(ty, &[row.into_entity(ty)?]).await?;
                }
                LoggedChange::Delete { entity, row } => {
                    let ty = schema.resolve(&entity)?;
                    tx.insert(ty, &[row.into_entity(ty)?]).await?;
                }
            }
        }
        tx.delete_hot_block(block.height).await?;
        event!(Level::DEBUG, changes = log.len(), "hot block rolled back");
        Ok(())
    }
    .instrument(span)
    .await
}
