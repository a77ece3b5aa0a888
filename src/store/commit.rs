// ============================================================================
// Commit Planning
// ============================================================================
//
// Turns the pending change set into an ordered list of write statements.
//
//   1. For each entity type in commit order, write its pending inserts and
//      upserts in passes. A reference to a row that is pending write but not
//      yet written is handled as:
//        nullable relation         -> written as NULL, patched afterwards
//        non-nullable, same type   -> row delayed to the next pass
//        non-nullable, other type  -> UnresolvableReference
//      A pass that writes nothing while rows still wait is a cycle of
//      non-nullable self references and fails the same way. Inserts of a
//      pass run before its upserts, so an insert never counts an upsert of
//      its own pass as written.
//   2. Patch upserts for every nulled relation, per type in commit order.
//   3. Deletes in reverse commit order.
//
// ============================================================================

use crate::cache::EntityCache;
use crate::core::{Result, StoreError};
use crate::entity::{Entity, EntityKey};
use crate::schema::{EntityType, EntityTypeId, SchemaRegistry};
use crate::tracker::{ChangeKind, ChangeTracker};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    Insert { entity: EntityTypeId, rows: Vec<Entity> },
    Upsert { entity: EntityTypeId, rows: Vec<Entity> },
    Delete { entity: EntityTypeId, ids: Vec<String> },
}

impl WriteStep {
    pub fn entity(&self) -> EntityTypeId {
        match self {
            Self::Insert { entity, .. }
            | Self::Upsert { entity, .. }
            | Self::Delete { entity, .. } => *entity,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Insert { rows, .. } | Self::Upsert { rows, .. } => rows.len(),
            Self::Delete { ids, .. } => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    steps: Vec<WriteStep>,
}

impl CommitPlan {
    pub fn steps(&self) -> &[WriteStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<WriteStep> {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    fn push_rows(
        &mut self,
        entity: EntityTypeId,
        kind: ChangeKind,
        rows: Vec<Entity>,
        batch: usize,
    ) {
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Entity> = rows.by_ref().take(batch).collect();
            self.steps.push(match kind {
                ChangeKind::Insert => WriteStep::Insert { entity, rows: chunk },
                _ => WriteStep::Upsert { entity, rows: chunk },
            });
        }
    }

    fn push_deletes(&mut self, entity: EntityTypeId, ids: Vec<String>, batch: usize) {
        for chunk in ids.chunks(batch) {
            self.steps.push(WriteStep::Delete {
                entity,
                ids: chunk.to_vec(),
            });
        }
    }
}

struct Pending {
    key: EntityKey,
    kind: ChangeKind,
    row: Entity,
    blocked_by: Option<(String, String)>,
}

pub(crate) fn plan_commit(
    schema: &SchemaRegistry,
    cache: &EntityCache,
    tracker: &ChangeTracker,
    batch_size: usize,
) -> Result<CommitPlan> {
    let batch = batch_size.max(1);
    let mut plan = CommitPlan::default();
    let mut written: HashSet<EntityKey> = HashSet::new();
    let mut patches: Vec<(EntityTypeId, Vec<Entity>)> = Vec::new();
    let mut deletes: Vec<(EntityTypeId, Vec<String>)> = Vec::new();

    for type_id in schema.commit_order().iter() {
        let ty = schema.get(type_id);
        let mut waiting = Vec::new();
        let mut deleted = Vec::new();

        for (key, kind) in tracker.changes_for(type_id) {
            if kind == ChangeKind::Delete {
                deleted.push(key.id);
                continue;
            }
            let row = cache.row(&key).ok_or_else(|| {
                StoreError::Invariant(format!(
                    "{} {} is pending {} but has no cached value",
                    ty.name(),
                    key.id,
                    kind
                ))
            })?;
            waiting.push(Pending {
                key,
                kind,
                row,
                blocked_by: None,
            });
        }

        let mut type_patches: BTreeMap<String, Entity> = BTreeMap::new();
        while !waiting.is_empty() {
            let mut inserts = Vec::new();
            let mut upserts = Vec::new();
            let mut delayed = Vec::new();

            // upserts of this pass run after its inserts
            let mut upserted: HashSet<EntityKey> = HashSet::new();

            for mut pending in waiting {
                pending.blocked_by = None;
                let is_insert = pending.kind == ChangeKind::Insert;
                let visible = |key: &EntityKey| {
                    written.contains(key) || (!is_insert && upserted.contains(key))
                };
                resolve_references(ty, tracker, visible, &mut pending, &mut type_patches)?;
                if pending.blocked_by.is_some() {
                    delayed.push(pending);
                    continue;
                }
                if is_insert {
                    written.insert(pending.key);
                    inserts.push(pending.row);
                } else {
                    upserted.insert(pending.key);
                    upserts.push(pending.row);
                }
            }

            if inserts.is_empty() && upserts.is_empty() {
                let Some(stuck) = delayed.into_iter().next() else {
                    break;
                };
                let (relation, target_id) = stuck.blocked_by.unwrap_or_default();
                return Err(StoreError::UnresolvableReference {
                    entity: ty.name().to_string(),
                    id: stuck.key.id,
                    relation,
                    target: ty.name().to_string(),
                    target_id,
                });
            }

            plan.push_rows(type_id, ChangeKind::Insert, inserts, batch);
            plan.push_rows(type_id, ChangeKind::Upsert, upserts, batch);
            written.extend(upserted);
            waiting = delayed;
        }

        if !type_patches.is_empty() {
            patches.push((type_id, type_patches.into_values().collect()));
        }
        if !deleted.is_empty() {
            deletes.push((type_id, deleted));
        }
    }

    for (type_id, rows) in patches {
        plan.push_rows(type_id, ChangeKind::Upsert, rows, batch);
    }
    for (type_id, ids) in deletes.into_iter().rev() {
        plan.push_deletes(type_id, ids, batch);
    }

    Ok(plan)
}

/// Nulls or blocks references to rows that are pending write but not written.
fn resolve_references(
    ty: &EntityType,
    tracker: &ChangeTracker,
    written: impl Fn(&EntityKey) -> bool,
    pending: &mut Pending,
    patches: &mut BTreeMap<String, Entity>,
) -> Result<()> {
    for rel in ty.owning_relations() {
        let Some(Some(target_id)) = pending.row.ref_id(rel.name()) else {
            continue;
        };
        let target_id = target_id.to_string();
        let target = EntityKey::new(rel.target(), target_id.as_str());
        if target == pending.key || !tracker.is_pending_write(&target) || written(&target) {
            continue;
        }

        if rel.is_nullable() {
            patches
                .entry(pending.key.id.clone())
                .or_insert_with(|| Entity::new(ty.name(), pending.key.id.as_str()))
                .set_ref(rel.name(), Some(Entity::stub(rel.target_name(), target_id)));
            pending.row.set_ref(rel.name(), None);
        } else if rel.target() == ty.id() {
            pending.blocked_by = Some((rel.name().to_string(), target_id));
        } else {
            return Err(StoreError::UnresolvableReference {
                entity: ty.name().to_string(),
                id: pending.key.id.clone(),
                relation: rel.name().to_string(),
                target: rel.target_name().to_string(),
                target_id,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::entity::RelationMask;
    use crate::schema::{EntityTypeDef, RelationDef};
    use std::sync::Arc;

    struct Fixture {
        schema: Arc<SchemaRegistry>,
        cache: EntityCache,
        tracker: ChangeTracker,
    }

    impl Fixture {
        fn new(schema: SchemaRegistry) -> Self {
            let schema = Arc::new(schema);
            Self {
                cache: EntityCache::new(schema.clone()),
                tracker: ChangeTracker::new(schema.clone()),
                schema,
            }
        }

        fn insert(&mut self, entity: Entity) {
            let key = self.cache.add(&entity, &RelationMask::new()).unwrap();
            self.tracker.insert(&key).unwrap();
        }

        fn delete(&mut self, entity: &str, id: &str) {
            let key = EntityKey::new(self.schema.resolve(entity).unwrap().id(), id);
            self.cache.delete(&key);
            self.tracker.delete(&key);
        }

        fn plan(&self, batch: usize) -> Result<CommitPlan> {
            plan_commit(&self.schema, &self.cache, &self.tracker, batch)
        }

        fn name(&self, step: &WriteStep) -> String {
            let kind = match step {
                WriteStep::Insert { .. } => "insert",
                WriteStep::Upsert { .. } => "upsert",
                WriteStep::Delete { .. } => "delete",
            };
            format!("{} {}", kind, self.schema.get(step.entity()).name())
        }
    }

    fn blog() -> SchemaRegistry {
        SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Post")
                    .relation(RelationDef::many_to_one("author", "Author").not_null()),
            )
            .entity(EntityTypeDef::new("Author").column("name", DataType::Text))
            .build()
            .unwrap()
    }

    #[test]
    fn test_targets_are_written_first() {
        let mut f = Fixture::new(blog());
        f.insert(Entity::new("Post", "p1").with_ref("author", "Author", "a1"));
        f.insert(Entity::new("Author", "a1").with("name", "Ann"));

        let plan = f.plan(100).unwrap();
        let names: Vec<String> = plan.steps().iter().map(|s| f.name(s)).collect();
        assert_eq!(names, vec!["insert Author", "insert Post"]);
    }

    #[test]
    fn test_deletes_run_in_reverse_order() {
        let mut f = Fixture::new(blog());
        f.delete("Author", "a1");
        f.delete("Post", "p1");

        let plan = f.plan(100).unwrap();
        let names: Vec<String> = plan.steps().iter().map(|s| f.name(s)).collect();
        assert_eq!(names, vec!["delete Post", "delete Author"]);
    }

    #[test]
    fn test_nullable_cycle_is_patched() {
        let schema = SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Team").relation(RelationDef::one_to_one("captain", "Player")),
            )
            .entity(
                EntityTypeDef::new("Player")
                    .relation(RelationDef::many_to_one("team", "Team").not_null()),
            )
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        f.insert(Entity::new("Player", "pl1").with_ref("team", "Team", "t1"));
        f.insert(Entity::new("Team", "t1").with_ref("captain", "Player", "pl1"));

        let steps = f.plan(100).unwrap().into_steps();
        assert_eq!(steps.len(), 3);
        let WriteStep::Insert { rows, .. } = &steps[0] else {
            panic!("expected team insert first");
        };
        assert_eq!(rows[0].ref_id("captain"), Some(None));
        assert!(matches!(steps[1], WriteStep::Insert { .. }));
        let WriteStep::Upsert { rows, .. } = &steps[2] else {
            panic!("expected captain patch");
        };
        assert_eq!(rows[0].id(), "t1");
        assert_eq!(rows[0].ref_id("captain"), Some(Some("pl1")));
    }

    #[test]
    fn test_non_nullable_self_reference_is_delayed() {
        let schema = SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Node")
                    .relation(RelationDef::many_to_one("prev", "Node").not_null()),
            )
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        f.insert(Entity::new("Node", "n2").with_ref("prev", "Node", "n1"));
        f.insert(Entity::new("Node", "n1").with_ref("prev", "Node", "n1"));

        let steps = f.plan(100).unwrap().into_steps();
        let ids: Vec<Vec<&str>> = steps
            .iter()
            .map(|s| match s {
                WriteStep::Insert { rows, .. } => rows.iter().map(|r| r.id()).collect(),
                _ => panic!("unexpected step"),
            })
            .collect();
        assert_eq!(ids, vec![vec!["n1"], vec!["n2"]]);
    }

    #[test]
    fn test_insert_waits_for_upsert_of_same_type() {
        let schema = SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Node")
                    .relation(RelationDef::many_to_one("parent", "Node").not_null()),
            )
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        let y = Entity::new("Node", "y").with_ref("parent", "Node", "y");
        let key = f.cache.add(&y, &RelationMask::new()).unwrap();
        f.tracker.upsert(&key);
        f.insert(Entity::new("Node", "x").with_ref("parent", "Node", "y"));

        let steps = f.plan(100).unwrap().into_steps();
        let names: Vec<String> = steps.iter().map(|s| f.name(s)).collect();
        assert_eq!(names, vec!["upsert Node", "insert Node"]);
        let WriteStep::Insert { rows, .. } = &steps[1] else {
            panic!("expected insert of x");
        };
        assert_eq!(rows[0].ref_id("parent"), Some(Some("y")));
    }

    #[test]
    fn test_nullable_reference_to_upsert_of_same_pass_is_patched() {
        let schema = SchemaRegistry::builder()
            .entity(EntityTypeDef::new("Node").relation(RelationDef::many_to_one("next", "Node")))
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        let key = f
            .cache
            .add(&Entity::new("Node", "b"), &RelationMask::new())
            .unwrap();
        f.tracker.upsert(&key);
        f.insert(Entity::new("Node", "a").with_ref("next", "Node", "b"));

        let steps = f.plan(100).unwrap().into_steps();
        let names: Vec<String> = steps.iter().map(|s| f.name(s)).collect();
        assert_eq!(names, vec!["insert Node", "upsert Node", "upsert Node"]);
        let WriteStep::Insert { rows, .. } = &steps[0] else {
            panic!("expected insert of a");
        };
        assert_eq!(rows[0].ref_id("next"), Some(None));
        let WriteStep::Upsert { rows, .. } = &steps[2] else {
            panic!("expected patch of a");
        };
        assert_eq!(rows[0].id(), "a");
        assert_eq!(rows[0].ref_id("next"), Some(Some("b")));
    }

    #[test]
    fn test_non_nullable_self_cycle_fails() {
        let schema = SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Node")
                    .relation(RelationDef::many_to_one("prev", "Node").not_null()),
            )
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        f.insert(Entity::new("Node", "n1").with_ref("prev", "Node", "n2"));
        f.insert(Entity::new("Node", "n2").with_ref("prev", "Node", "n1"));

        assert!(matches!(
            f.plan(100),
            Err(StoreError::UnresolvableReference { .. })
        ));
    }

    #[test]
    fn test_non_nullable_cross_type_cycle_fails() {
        let schema = SchemaRegistry::builder()
            .entity(EntityTypeDef::new("A").relation(RelationDef::one_to_one("b", "B").not_null()))
            .entity(EntityTypeDef::new("B").relation(RelationDef::one_to_one("a", "A").not_null()))
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        f.insert(Entity::new("A", "a1").with_ref("b", "B", "b1"));
        f.insert(Entity::new("B", "b1").with_ref("a", "A", "a1"));

        let err = f.plan(100).unwrap_err();
        let StoreError::UnresolvableReference { entity, target, .. } = err else {
            panic!("expected unresolvable reference, got {:?}", err);
        };
        assert_eq!((entity.as_str(), target.as_str()), ("B", "A"));
    }

    #[test]
    fn test_three_type_cycle_is_patched_on_nullable_edge() {
        let schema = SchemaRegistry::builder()
            .entity(EntityTypeDef::new("A").relation(RelationDef::many_to_one("b", "B")))
            .entity(EntityTypeDef::new("B").relation(RelationDef::many_to_one("c", "C").not_null()))
            .entity(EntityTypeDef::new("C").relation(RelationDef::many_to_one("a", "A").not_null()))
            .build()
            .unwrap();
        let mut f = Fixture::new(schema);
        f.insert(Entity::new("C", "c1").with_ref("a", "A", "a1"));
        f.insert(Entity::new("B", "b1").with_ref("c", "C", "c1"));
        f.insert(Entity::new("A", "a1").with_ref("b", "B", "b1"));

        let steps = f.plan(100).unwrap().into_steps();
        let names: Vec<String> = steps.iter().map(|s| f.name(s)).collect();
        assert_eq!(names, vec!["insert A", "insert C", "insert B", "upsert A"]);
        let WriteStep::Upsert { rows, .. } = &steps[3] else {
            panic!("expected patch of a1");
        };
        assert_eq!(rows[0].ref_id("b"), Some(Some("b1")));
    }

    #[test]
    fn test_writes_are_chunked() {
        let mut f = Fixture::new(blog());
        for i in 0..5 {
            f.insert(Entity::new("Author", format!("a{}", i)).with("name", "x"));
        }
        let plan = f.plan(2).unwrap();
        let sizes: Vec<usize> = plan.steps().iter().map(WriteStep::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_reference_to_stored_row_is_untouched() {
        let mut f = Fixture::new(blog());
        // a1 is not pending, so the reference is written as is
        f.insert(Entity::new("Post", "p1").with_ref("author", "Author", "a1"));

        let steps = f.plan(100).unwrap().into_steps();
        let WriteStep::Insert { rows, .. } = &steps[0] else {
            panic!("expected insert");
        };
        assert_eq!(rows[0].ref_id("author"), Some(Some("a1")));
    }
}
