use super::commit_order::{CommitOrder, resolve_commit_order};
use super::{Cardinality, EntityType, EntityTypeDef, EntityTypeId, Relation};
use crate::core::{Result, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Immutable catalog of entity types, built once per run.
///
/// Types are stored in an arena indexed by [`EntityTypeId`]. The commit
/// order is computed lazily on first use and memoized for the lifetime of
/// the registry.
#[derive(Debug)]
pub struct SchemaRegistry {
    types: Vec<EntityType>,
    by_name: HashMap<String, EntityTypeId>,
    commit_order: OnceLock<CommitOrder>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, id: EntityTypeId) -> &EntityType {
        &self.types[id.0]
    }

    pub fn resolve(&self, name: &str) -> Result<&EntityType> {
        self.by_name
            .get(name)
            .map(|id| &self.types[id.0])
            .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
    }

    pub fn types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn commit_order(&self) -> &CommitOrder {
        self.commit_order.get_or_init(|| resolve_commit_order(&self.types))
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    defs: Vec<EntityTypeDef>,
}

impl SchemaBuilder {
    pub fn entity(mut self, def: EntityTypeDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Result<SchemaRegistry> {
        let mut by_name = HashMap::new();
        for (idx, def) in self.defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), EntityTypeId(idx)).is_some() {
                return Err(StoreError::Schema(format!(
                    "Entity type '{}' registered twice",
                    def.name
                )));
            }
        }

        let mut types = Vec::with_capacity(self.defs.len());
        for (idx, def) in self.defs.iter().enumerate() {
            check_field_names(def)?;

            let mut relations = Vec::with_capacity(def.relations.len());
            for rel in &def.relations {
                let target = *by_name.get(&rel.target).ok_or_else(|| {
                    StoreError::Schema(format!(
                        "Relation {}.{} targets unknown entity type '{}'",
                        def.name, rel.name, rel.target
                    ))
                })?;
                relations.push(Relation {
                    name: rel.name.clone(),
                    target,
                    target_name: rel.target.clone(),
                    cardinality: rel.cardinality,
                    owning: rel.owning,
                    nullable: rel.nullable,
                    inverse_of: rel.inverse_of.clone(),
                });
            }

            types.push(EntityType {
                id: EntityTypeId(idx),
                name: def.name.clone(),
                columns: def.columns.clone(),
                relations,
            });
        }

        for ty in &types {
            for rel in &ty.relations {
                check_relation(&types, ty, rel)?;
            }
        }

        Ok(SchemaRegistry {
            types,
            by_name,
            commit_order: OnceLock::new(),
        })
    }
}

fn check_field_names(def: &EntityTypeDef) -> Result<()> {
    let mut seen = HashSet::new();
    let names = def
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .chain(def.relations.iter().map(|r| r.name.as_str()));
    for name in names {
        if name == "id" {
            return Err(StoreError::Schema(format!(
                "Entity type '{}' must not declare the implicit 'id' field",
                def.name
            )));
        }
        if !seen.insert(name) {
            return Err(StoreError::Schema(format!(
                "Field '{}' declared twice on entity type '{}'",
                name, def.name
            )));
        }
    }
    Ok(())
}

fn check_relation(types: &[EntityType], owner: &EntityType, rel: &Relation) -> Result<()> {
    let fail = |msg: &str| {
        Err(StoreError::Schema(format!(
            "Relation {}.{}: {}",
            owner.name, rel.name, msg
        )))
    };

    match (rel.cardinality, rel.owning) {
        (Cardinality::OneToMany, true) => {
            return fail("one-to-many relations cannot own a foreign key");
        }
        (Cardinality::ManyToOne, false) => {
            return fail("many-to-one relations must own the foreign key");
        }
        _ => {}
    }

    if rel.owning {
        return Ok(());
    }

    let Some(inverse_of) = rel.inverse_of.as_deref() else {
        return fail("inverse relations must name the owning side");
    };
    let target = &types[rel.target.0];
    match target.relation(inverse_of) {
        Some(owning) if owning.owning && owning.target == owner.id => Ok(()),
        _ => fail(&format!(
            "'{}.{}' is not an owning relation back to '{}'",
            target.name, inverse_of, owner.name
        )),
    }
}
