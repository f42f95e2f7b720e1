//! Represents a folder, an immutable, append-only collection of uploads.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

use super::file_record::MetadataSnapshot;

/// A named collection of related files sharing project/author/experiment
/// metadata.
///
/// `file_count` and `total_size` are aggregates over the folder's file rows.
/// They are only ever changed by the atomic increment that accompanies a file
/// insert, never written directly.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Folder {
    pub id: Uuid,

    /// Display name, unique within a project.
    pub name: String,

    /// Storage namespace for this folder's object keys, e.g. `FS1/session_1/`.
    pub key_prefix: String,

    pub project: String,
    pub author: String,
    pub experiment_type: Option<String>,
    pub date_conducted: Option<NaiveDate>,
    pub tags: Json<Vec<String>>,
    pub notes: Option<String>,

    /// Always true today: folders only ever grow.
    pub immutable: bool,

    pub file_count: i64,
    pub total_size: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Folder {
    /// The metadata copied onto each file indexed into this folder.
    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            project: self.project.clone(),
            author: self.author.clone(),
            experiment_type: self.experiment_type.clone(),
            date_conducted: self.date_conducted,
            tags: self.tags.0.clone(),
        }
    }
}

/// Column list matching [`Folder`]'s field order.
pub const FOLDER_COLUMNS: &str = "id, name, key_prefix, project, author, experiment_type, \
     date_conducted, tags, notes, immutable, file_count, total_size, created_at, updated_at";
