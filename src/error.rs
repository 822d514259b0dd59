//! Error types for chronos-db.
//!
//! Errors follow a hierarchical system:
//! - [`ChronosError`] is the top-level error returned by all public APIs
//! - Specific error types (`ValidationError`, `NotFoundError`, ...) provide detail
//!
//! The variant set matches the error taxonomy in `spec.md` §7 exactly:
//! `ValidationError`, `NotFoundError`, `OptimisticLockError`, `LockBusy`,
//! `RouteError`, `StorageError`, `TxnError`, `ConfigError`. The fallback
//! worker classifies errors against this *tag*, never against a message
//! substring (`spec.md` §9, "runtime classification of errors by message
//! substring... replace with a tagged error variant").

use thiserror::Error;

use crate::types::{ItemId, Ov};

/// Result type alias for chronos-db operations.
pub type Result<T> = std::result::Result<T, ChronosError>;

/// Top-level error enum for all chronos-db operations.
#[derive(Debug, Error)]
pub enum ChronosError {
    /// Missing required indexed field, invalid base64, invalid template
    /// variable, malformed context, or a missing confirmation on a
    /// destructive op. Non-retryable.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown id/version. Non-retryable.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// `expectedOv` did not match `head.ov` at commit time. Caller must
    /// re-read and re-issue. Non-retryable.
    #[error("Optimistic lock failed on {id}: expected ov {expected}, head is at a different version")]
    OptimisticLock {
        /// The record whose head moved out from under the caller.
        id: ItemId,
        /// The ov the caller expected the head to be at.
        expected: Ov,
    },

    /// Cross-process lock currently held by another writer. Retryable with
    /// backoff.
    #[error("Lock busy on {0}")]
    LockBusy(ItemId),

    /// Cannot resolve a backend for the given route context. Non-retryable.
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Blob-store failure. Retryable.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metadata transaction aborted. Retryable.
    #[error("Transaction error: {0}")]
    Txn(String),

    /// Configuration invariant violated at init. Fatal.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChronosError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a transaction error with the given reason.
    pub fn txn(reason: impl Into<String>) -> Self {
        Self::Txn(reason.into())
    }

    /// Creates an optimistic-lock error for the given id/expected-ov pair.
    pub fn optimistic_lock(id: ItemId, expected: Ov) -> Self {
        Self::OptimisticLock { id, expected }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    pub fn is_lock_busy(&self) -> bool {
        matches!(self, Self::LockBusy(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn is_route(&self) -> bool {
        matches!(self, Self::Route(_))
    }

    pub fn is_txn(&self) -> bool {
        matches!(self, Self::Txn(_))
    }

    /// Whether the fallback queue should treat this error as permanent
    /// (move to dead letter without retrying) per `spec.md` §4.9/§7:
    /// `ValidationError`, `NotFoundError`, and `OptimisticLockError` are
    /// never retried; everything else is retryable.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::OptimisticLock { .. }
        )
    }
}

/// Storage-related errors (blob store or metadata store transport/corruption).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Database corrupted: {0}")]
    Corrupted(String),

    #[error("Database is locked by another writer")]
    DatabaseLocked,

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage engine error: {0}")]
    Backend(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),
}

impl StorageError {
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("commit failed: {err}"))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Backend(format!("table error: {err}"))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Backend(format!("storage error: {err}"))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

macro_rules! impl_from_storage {
    ($t:ty) => {
        impl From<$t> for ChronosError {
            fn from(err: $t) -> Self {
                ChronosError::Storage(StorageError::from(err))
            }
        }
    };
}

impl_from_storage!(redb::Error);
impl_from_storage!(redb::DatabaseError);
impl_from_storage!(redb::TransactionError);
impl_from_storage!(redb::CommitError);
impl_from_storage!(redb::TableError);
impl_from_storage!(redb::StorageError);
impl_from_storage!(bincode::Error);
impl_from_storage!(object_store::Error);

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Required field missing: {field}")]
    RequiredField { field: String },

    #[error("Undefined template placeholder: {0}")]
    UndefinedPlaceholder(String),

    #[error("Invalid base64 content for property '{property}': {reason}")]
    InvalidBase64 { property: String, reason: String },

    #[error("Malformed route context: {0}")]
    MalformedContext(String),

    #[error("Destructive operation requires confirmation")]
    ConfirmationRequired,
}

impl ValidationError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }

    pub fn invalid_base64(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBase64 {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

/// Not-found errors for specific entity types.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("Record not found: {0}")]
    Item(ItemId),

    #[error("Version not found: {id} at ov {ov}")]
    Version { id: ItemId, ov: Ov },

    #[error("Collection not found: {0}")]
    Collection(String),

    #[error("Fallback op not found: {0}")]
    FallbackOp(String),
}

impl NotFoundError {
    pub fn item(id: ItemId) -> Self {
        Self::Item(id)
    }

    pub fn version(id: ItemId, ov: Ov) -> Self {
        Self::Version { id, ov }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Self::Collection(name.into())
    }
}

/// Errors resolving a [`crate::router::RouteContext`] to a concrete backend.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("No static or dynamic match for route context: {0}")]
    NoMatch(String),

    #[error("Dynamic tenants are disabled; cannot resolve tenant '{0}'")]
    DynamicTenantsDisabled(String),

    #[error("Tenant id '{0}' failed validation: {1}")]
    InvalidTenantId(String, String),

    #[error("Undefined template placeholder '{0}' while resolving tenant '{1}'")]
    UndefinedPlaceholder(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChronosError::config("missing bucket set");
        assert_eq!(err.to_string(), "Configuration error: missing bucket set");
    }

    #[test]
    fn test_optimistic_lock_display() {
        let id = ItemId::nil();
        let err = ChronosError::optimistic_lock(id, Ov(3));
        assert!(err.to_string().contains("Optimistic lock failed"));
        assert!(err.is_optimistic_lock());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(ChronosError::from(ValidationError::required_field("x")).is_permanent());
        assert!(ChronosError::from(NotFoundError::item(ItemId::nil())).is_permanent());
        assert!(ChronosError::optimistic_lock(ItemId::nil(), Ov(0)).is_permanent());
        assert!(!ChronosError::LockBusy(ItemId::nil()).is_permanent());
        assert!(!ChronosError::txn("aborted").is_permanent());
    }

    #[test]
    fn test_is_validation() {
        let err: ChronosError = ValidationError::required_field("content").into();
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_display() {
        let err = NotFoundError::collection("users");
        assert_eq!(err.to_string(), "Collection not found: users");
    }

    #[test]
    fn test_error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(StorageError::corrupted("test corruption"))?
        }
        let result = inner();
        assert!(result.is_err());
        assert!(result.unwrap_err().is_storage());
    }
}
