use crate::core::{Column, DataType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an entity type inside its [`SchemaRegistry`](super::SchemaRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(pub(crate) usize);

impl EntityTypeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
}

/// Relation as declared by the data model, before target names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub owning: bool,
    pub nullable: bool,
    /// Owning relation on `target` mirrored by this inverse side.
    pub inverse_of: Option<String>,
}

impl RelationDef {
    /// Owning `many-to-one` side; stores the foreign key.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ManyToOne,
            owning: true,
            nullable: true,
            inverse_of: None,
        }
    }

    /// Owning `one-to-one` side; stores the foreign key.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            cardinality: Cardinality::OneToOne,
            ..Self::many_to_one(name, target)
        }
    }

    /// Inverse `one-to-one` side of `target.inverse_of`.
    pub fn one_to_one_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse_of: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::OneToOne,
            owning: false,
            nullable: true,
            inverse_of: Some(inverse_of.into()),
        }
    }

    /// Inverse `one-to-many` collection of `target.inverse_of`.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse_of: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToMany,
            ..Self::one_to_one_inverse(name, target, inverse_of)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Entity type as declared by the data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTypeDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub relations: Vec<RelationDef>,
}

impl EntityTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(Column::new(name, data_type));
        self
    }

    pub fn required(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(Column::new(name, data_type).not_null());
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }
}

/// Resolved relation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub(crate) name: String,
    pub(crate) target: EntityTypeId,
    pub(crate) target_name: String,
    pub(crate) cardinality: Cardinality,
    pub(crate) owning: bool,
    pub(crate) nullable: bool,
    pub(crate) inverse_of: Option<String>,
}

impl Relation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> EntityTypeId {
        self.target
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// True when this side physically stores the foreign key.
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn inverse_of(&self) -> Option<&str> {
        self.inverse_of.as_deref()
    }
}

/// Immutable description of one entity type.
///
/// Every entity type has an implicit text primary key named `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub(crate) id: EntityTypeId,
    pub(crate) name: String,
    pub(crate) columns: Vec<Column>,
    pub(crate) relations: Vec<Relation>,
}

impl EntityType {
    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn owning_relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(|r| r.owning)
    }
}
