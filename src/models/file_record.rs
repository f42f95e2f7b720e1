//! Represents the index entry for one stored object.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// Indexed metadata for a single object in the bucket.
///
/// Project, author, experiment and tag fields are a copy of the owning
/// folder's values taken at insert time, so file search needs no join. They
/// are not refreshed if the folder changes later.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    pub file_id: Uuid,

    /// Owning folder; `None` for standalone single-file uploads.
    pub folder_id: Option<Uuid>,

    pub bucket: String,

    /// Full object key, unique within `bucket`.
    pub object_name: String,

    /// Path inside the folder (folder uploads only).
    pub relative_path: Option<String>,

    pub original_filename: String,

    /// Final filename after sanitising and collision renaming.
    pub stored_filename: String,

    /// Upper-cased extension, or `UNKNOWN`.
    pub extension: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: i64,

    /// MD5 reported by the object store.
    pub checksum_etag: Option<String>,

    pub created_at: DateTime<Utc>,

    pub project: String,
    pub author: String,
    pub experiment_type: Option<String>,
    pub date_conducted: Option<NaiveDate>,
    pub tags: Json<Vec<String>>,
}

/// Column list matching [`FileRecord`]'s field order.
pub const FILE_COLUMNS: &str = "file_id, folder_id, bucket, object_name, relative_path, \
     original_filename, stored_filename, extension, content_type, size_bytes, checksum_etag, \
     created_at, project, author, experiment_type, date_conducted, tags";

/// Descriptive metadata denormalized onto each file row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub project: String,
    pub author: String,
    pub experiment_type: Option<String>,
    pub date_conducted: Option<NaiveDate>,
    pub tags: Vec<String>,
}

/// Everything needed to insert a new [`FileRecord`].
#[derive(Clone, Debug)]
pub struct NewFileRecord {
    pub folder_id: Option<Uuid>,
    pub bucket: String,
    pub object_name: String,
    pub relative_path: Option<String>,
    pub original_filename: String,
    pub stored_filename: String,
    pub extension: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum_etag: Option<String>,
    pub metadata: MetadataSnapshot,
}
