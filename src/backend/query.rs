use crate::core::{Result, StoreError, Value};
use crate::entity::Entity;
use crate::schema::EntityType;
use std::cmp::Ordering;

/// Row predicate.
///
/// `field` is `id`, a column name, or the name of an owning relation, in
/// which case the foreign-key id is compared. Comparisons follow SQL: a
/// NULL operand never matches anything but `IsNull`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self::NotNull(field.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _)
            | Self::Ne(f, _)
            | Self::In(f, _)
            | Self::IsNull(f)
            | Self::NotNull(f)
            | Self::Gt(f, _)
            | Self::Gte(f, _)
            | Self::Lt(f, _)
            | Self::Lte(f, _) => f,
        }
    }

    /// Evaluates the predicate against the value of its field.
    pub fn matches(&self, value: &Value) -> bool {
        let cmp = |other: &Value| -> Option<Ordering> {
            if value.is_null() || other.is_null() {
                return None;
            }
            value.compare(other).ok()
        };

        match self {
            Self::IsNull(_) => value.is_null(),
            Self::NotNull(_) => !value.is_null(),
            Self::Eq(_, v) => cmp(v) == Some(Ordering::Equal),
            Self::Ne(_, v) => matches!(cmp(v), Some(o) if o != Ordering::Equal),
            Self::In(_, values) => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
            Self::Gt(_, v) => cmp(v) == Some(Ordering::Greater),
            Self::Gte(_, v) => matches!(cmp(v), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt(_, v) => cmp(v) == Some(Ordering::Less),
            Self::Lte(_, v) => matches!(cmp(v), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Query shape understood by backends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
}

impl FindQuery {
    pub fn by_ids(ids: &[String]) -> Self {
        Self {
            filters: vec![Filter::is_in("id", ids.iter().map(String::as_str))],
            ..Self::default()
        }
    }
}

/// Value a row holds for `field` (`id`, column, or owning relation key).
pub fn field_value(entity_type: &EntityType, row: &Entity, field: &str) -> Result<Value> {
    if field == "id" {
        return Ok(Value::Text(row.id().to_string()));
    }
    if entity_type.column(field).is_some() {
        return Ok(row.field(field).cloned().unwrap_or(Value::Null));
    }
    match entity_type.relation(field) {
        Some(rel) if rel.is_owning() => Ok(row
            .ref_id(field)
            .flatten()
            .map(|id| Value::Text(id.to_string()))
            .unwrap_or(Value::Null)),
        _ => Err(StoreError::UnknownField {
            entity: entity_type.name().to_string(),
            field: field.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_null_semantics() {
        assert!(!Filter::eq("x", Value::Null).matches(&Value::Null));
        assert!(!Filter::ne("x", 1).matches(&Value::Null));
        assert!(Filter::is_null("x").matches(&Value::Null));
        assert!(Filter::not_null("x").matches(&Value::Integer(0)));
    }

    #[test]
    fn test_comparisons() {
        let five = Value::Integer(5);
        assert!(Filter::gt("x", 4).matches(&five));
        assert!(Filter::gte("x", 5).matches(&five));
        assert!(!Filter::lt("x", 5).matches(&five));
        assert!(Filter::lte("x", 5.0).matches(&five));
        assert!(Filter::is_in("x", [1, 5, 9]).matches(&five));
        assert!(!Filter::eq("x", "5").matches(&five));
    }
}
