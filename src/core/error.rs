use thiserror::Error;

/// SQLSTATE reported by relational engines when a transaction could not be
/// serialized against a concurrent one.
pub const SERIALIZATION_FAILURE_CODE: &str = "40001";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown entity type '{0}'")]
    UnknownEntity(String),

    #[error("Entity type '{entity}' has no field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{entity} {id} is already pending insert/upsert")]
    DuplicateInsert { entity: String, id: String },

    #[error("Too late to perform updates: the store is closed")]
    StoreClosed,

    #[error("Missing relation {entity}.{relation}: {target} {target_id} is not in the cache")]
    MissingRelation {
        entity: String,
        relation: String,
        target: String,
        target_id: String,
    },

    #[error(
        "Cannot commit {entity} {id}: non-nullable relation '{relation}' points at {target} {target_id} which is not written yet"
    )]
    UnresolvableReference {
        entity: String,
        id: String,
        relation: String,
        target: String,
        target_id: String,
    },

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Status table was updated by foreign process. Make sure no other processor is running. ({0})")]
    Race(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Backend error{}: {message}", code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
    Backend {
        code: Option<String>,
        message: String,
    },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`StoreError`] used by callers deciding whether
/// to retry, resynchronize or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid API usage. Never retried.
    Programmer,
    /// Persisted chain state diverged from what the caller expected.
    Race,
    /// Serialization conflict, safe to retry the whole transaction.
    Transient,
    /// A requested row does not exist.
    NotFound,
    /// Persisted state is corrupted.
    Invariant,
    /// Any other datastore failure.
    Backend,
}

impl StoreError {
    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownEntity(_)
            | Self::UnknownField { .. }
            | Self::TypeMismatch(_)
            | Self::ConstraintViolation(_)
            | Self::Schema(_)
            | Self::DuplicateInsert { .. }
            | Self::StoreClosed
            | Self::MissingRelation { .. }
            | Self::UnresolvableReference { .. }
            | Self::InvalidUsage(_) => ErrorKind::Programmer,
            Self::Race(_) => ErrorKind::Race,
            Self::SerializationFailure(_) => ErrorKind::Transient,
            Self::Backend { code, .. }
                if code.as_deref() == Some(SERIALIZATION_FAILURE_CODE) =>
            {
                ErrorKind::Transient
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Backend { .. } | Self::LockError(_) | Self::Json(_) => ErrorKind::Backend,
        }
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// Fails with [`StoreError::Invariant`] when `cond` does not hold.
pub(crate) fn ensure_invariant(cond: bool, message: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(StoreError::Invariant(message()))
    }
}
