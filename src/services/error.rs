//! Domain errors shared by every service in the lake.

use thiserror::Error;
use uuid::Uuid;

use super::object_store::ObjectStoreError;

/// Every problem found while validating user input, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl ValidationError {
    pub fn new(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }

    pub fn from_issues(issues: Vec<String>) -> Self {
        Self { issues }
    }

    /// Whether any issue mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.issues.iter().any(|issue| issue.contains(needle))
    }
}

#[derive(Debug, Error)]
pub enum LakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    /// A caller handed us a folder id that does not resolve. Never a user error.
    #[error("folder {0} does not exist")]
    FolderNotFound(Uuid),
    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(#[from] sqlx::Error),
    #[error("key allocation conflict: no free object key under `{prefix}` after {attempts} attempts")]
    Conflict { prefix: String, attempts: u32 },
    #[error("export aborted: object `{object_name}` could not be read ({reason})")]
    ExportIncomplete { object_name: String, reason: String },
    #[error("{0}")]
    Internal(String),
}

pub type LakeResult<T> = Result<T, LakeError>;

impl From<ObjectStoreError> for LakeError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::InvalidKey(key) => {
                ValidationError::new(format!("invalid object key `{}`", key)).into()
            }
            ObjectStoreError::NotFound { bucket, key } => {
                LakeError::NotFound(format!("object `{}` not found in bucket `{}`", key, bucket))
            }
            other => LakeError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Return true if SQLx error is a failed foreign key check.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.is_foreign_key_violation()
                || db_err.message().to_ascii_lowercase().contains("foreign key")
    )
}
