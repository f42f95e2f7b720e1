//! Writes file rows and keeps folder aggregates in step with them.

use chrono::Utc;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{
    error::{LakeError, LakeResult, is_foreign_key_violation},
    folder_service::FolderService,
    naming::{fold_case, fold_tags},
};
use crate::models::file_record::{FILE_COLUMNS, FileRecord, NewFileRecord};

#[derive(Clone)]
pub struct FileIndexWriter {
    db: Arc<SqlitePool>,
}

impl FileIndexWriter {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a file row. When the file belongs to a folder, the folder's
    /// aggregates are bumped in the same transaction, so the row and the
    /// counters commit or roll back together.
    ///
    /// Callers must only index objects that are already written.
    pub async fn index_file(&self, entry: NewFileRecord) -> LakeResult<FileRecord> {
        let mut tx = self.db.begin().await?;

        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO file_index (
                file_id, folder_id, bucket, object_name, relative_path,
                original_filename, stored_filename, extension, content_type,
                size_bytes, checksum_etag, created_at,
                project, author, experiment_type, date_conducted, tags,
                project_lc, author_lc, experiment_type_lc, extension_lc, tags_lc
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.folder_id)
        .bind(&entry.bucket)
        .bind(&entry.object_name)
        .bind(&entry.relative_path)
        .bind(&entry.original_filename)
        .bind(&entry.stored_filename)
        .bind(&entry.extension)
        .bind(&entry.content_type)
        .bind(entry.size_bytes)
        .bind(&entry.checksum_etag)
        .bind(Utc::now())
        .bind(&entry.metadata.project)
        .bind(&entry.metadata.author)
        .bind(&entry.metadata.experiment_type)
        .bind(entry.metadata.date_conducted)
        .bind(Json(&entry.metadata.tags))
        .bind(fold_case(&entry.metadata.project))
        .bind(fold_case(&entry.metadata.author))
        .bind(entry.metadata.experiment_type.as_deref().map(fold_case))
        .bind(entry.extension.as_deref().map(fold_case))
        .bind(fold_tags(&entry.metadata.tags))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match entry.folder_id {
            Some(folder_id) if is_foreign_key_violation(&err) => LakeError::FolderNotFound(folder_id),
            _ => err.into(),
        })?;

        if let Some(folder_id) = entry.folder_id {
            FolderService::record_file_added(&mut *tx, folder_id, entry.size_bytes).await?;
        }

        tx.commit().await?;

        info!(
            "indexed file {} key='{}' size={}",
            record.file_id, record.object_name, record.size_bytes
        );
        Ok(record)
    }
}
