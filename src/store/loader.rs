use crate::backend::{BackendTransaction, Filter, FindQuery};
use crate::core::{Result, StoreError};
use crate::entity::{Entity, RelationMask, RelationValue};
use crate::schema::{Cardinality, EntityType, SchemaRegistry};
use async_recursion::async_recursion;
use std::collections::{BTreeSet, HashMap};

/// Populates the relations named by `mask` on rows read from the database.
///
/// Walks one level at a time: every relation costs a single batched query
/// for all rows, then recurses into the fetched targets with the nested mask.
#[async_recursion]
pub(crate) async fn load_relations(
    tx: &dyn BackendTransaction,
    schema: &SchemaRegistry,
    entity_type: &EntityType,
    rows: &mut [Entity],
    mask: &RelationMask,
) -> Result<()> {
    if rows.is_empty() || mask.is_empty() {
        return Ok(());
    }

    for (name, nested) in mask.iter() {
        let Some(rel) = entity_type.relation(name) else {
            return Err(StoreError::UnknownField {
                entity: entity_type.name().to_string(),
                field: name.to_string(),
            });
        };
        let target_type = schema.get(rel.target());

        if rel.is_owning() {
            let ids: BTreeSet<String> = rows
                .iter()
                .filter_map(|row| row.ref_id(name).flatten().map(str::to_string))
                .collect();
            let mut targets = if ids.is_empty() {
                Vec::new()
            } else {
                let ids: Vec<String> = ids.into_iter().collect();
                tx.find(target_type, &FindQuery::by_ids(&ids)).await?
            };
            load_relations(tx, schema, target_type, &mut targets, nested).await?;

            let by_id: HashMap<String, Entity> = targets
                .into_iter()
                .map(|target| (target.id().to_string(), target))
                .collect();
            for row in rows.iter_mut() {
                let target = row
                    .ref_id(name)
                    .flatten()
                    .and_then(|id| by_id.get(id).cloned());
                row.set_ref(name, target);
            }
        } else {
            let Some(foreign_key) = rel.inverse_of() else {
                continue;
            };
            let parent_ids: Vec<String> = rows.iter().map(|row| row.id().to_string()).collect();
            let mut children = tx
                .find(
                    target_type,
                    &FindQuery {
                        filters: vec![Filter::is_in(
                            foreign_key,
                            parent_ids.iter().map(String::as_str),
                        )],
                        ..FindQuery::default()
                    },
                )
                .await?;
            load_relations(tx, schema, target_type, &mut children, nested).await?;

            let mut grouped: HashMap<String, Vec<Entity>> = HashMap::new();
            for child in children {
                if let Some(Some(parent)) = child.ref_id(foreign_key) {
                    grouped.entry(parent.to_string()).or_default().push(child);
                }
            }
            for row in rows.iter_mut() {
                let items = grouped.remove(row.id()).unwrap_or_default();
                let value = match rel.cardinality() {
                    Cardinality::OneToMany => RelationValue::Many(items),
                    _ => RelationValue::One(items.into_iter().next().map(Box::new)),
                };
                row.set_relation(name, value);
            }
        }
    }

    Ok(())
}
