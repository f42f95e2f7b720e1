//! Folder creation, lookup and the aggregate counters.
//!
//! A folder is identified by `(project, name)`. Its `key_prefix` is derived
//! from both as `<project>/<name>/`; when two identities sanitise to the same
//! prefix, later folders get `_<n>` appended to the name segment.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool, types::Json};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    error::{LakeError, LakeResult, is_unique_violation},
    metadata::UploadMetadata,
    naming::{fold_case, fold_tags, name_segment, project_segment},
};
use crate::models::{
    file_record::{FILE_COLUMNS, FileRecord},
    folder::{FOLDER_COLUMNS, Folder},
};

/// Upper bound on prefix disambiguation before giving up.
const MAX_PREFIX_SUFFIX: u32 = 1000;

#[derive(Clone)]
pub struct FolderService {
    db: Arc<SqlitePool>,
}

impl FolderService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Return the folder for `(meta.project, name)`, creating it on first use.
    ///
    /// An existing folder is returned unchanged: folders are never re-created
    /// or edited, and later uploads only append files to them.
    pub async fn create_or_get_folder(&self, name: &str, meta: &UploadMetadata) -> LakeResult<Folder> {
        let name = name.trim();
        let project_seg = project_segment(&meta.project);
        let name_seg = name_segment(name);

        for n in 0..MAX_PREFIX_SUFFIX {
            if let Some(existing) = self.find_by_identity(&meta.project, name).await? {
                debug!("reusing folder {} ({})", existing.id, existing.key_prefix);
                return Ok(existing);
            }

            let key_prefix = if n == 0 {
                format!("{}/{}/", project_seg, name_seg)
            } else {
                format!("{}/{}_{}/", project_seg, name_seg, n)
            };

            match self.insert_folder(name, &key_prefix, meta).await {
                Ok(folder) => {
                    info!("created folder {} at prefix {}", folder.id, folder.key_prefix);
                    return Ok(folder);
                }
                // Either the prefix belongs to another identity or a concurrent
                // request created this one; the identity check at the top of
                // the loop sorts out which.
                Err(err) if is_unique_violation(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(LakeError::Conflict {
            prefix: format!("{}/{}/", project_seg, name_seg),
            attempts: MAX_PREFIX_SUFFIX,
        })
    }

    async fn find_by_identity(&self, project: &str, name: &str) -> LakeResult<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders WHERE project = ? AND name = ?",
            FOLDER_COLUMNS
        ))
        .bind(project)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(folder)
    }

    async fn insert_folder(
        &self,
        name: &str,
        key_prefix: &str,
        meta: &UploadMetadata,
    ) -> Result<Folder, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Folder>(&format!(
            "INSERT INTO folders (
                id, name, key_prefix, project, author, experiment_type, date_conducted,
                tags, notes, project_lc, author_lc, experiment_type_lc, tags_lc,
                immutable, file_count, total_size, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, 0, ?, ?)
             RETURNING {}",
            FOLDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(key_prefix)
        .bind(&meta.project)
        .bind(&meta.author)
        .bind(&meta.experiment_type)
        .bind(meta.date_conducted)
        .bind(Json(&meta.tags))
        .bind(&meta.notes)
        .bind(fold_case(&meta.project))
        .bind(fold_case(&meta.author))
        .bind(meta.experiment_type.as_deref().map(fold_case))
        .bind(fold_tags(&meta.tags))
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await
    }

    /// Fetch a folder by id, or `NotFound`.
    pub async fn get_folder(&self, folder_id: Uuid) -> LakeResult<Folder> {
        sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders WHERE id = ?",
            FOLDER_COLUMNS
        ))
        .bind(folder_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| LakeError::NotFound("Folder not found.".to_string()))
    }

    /// Files of a folder ordered by relative path.
    pub async fn list_files(&self, folder_id: Uuid) -> LakeResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_index WHERE folder_id = ? ORDER BY relative_path ASC, file_id ASC",
            FILE_COLUMNS
        ))
        .bind(folder_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Bump the folder aggregates for one new file.
    ///
    /// Must run on the same transaction as the file row insert. The update is
    /// a single arithmetic statement, so concurrent uploads into one folder
    /// serialize in the database rather than racing a read-modify-write.
    pub async fn record_file_added(
        conn: &mut SqliteConnection,
        folder_id: Uuid,
        size_bytes: i64,
    ) -> LakeResult<()> {
        let result = sqlx::query(
            "UPDATE folders
             SET file_count = file_count + 1,
                 total_size = total_size + ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(size_bytes)
        .bind(Utc::now())
        .bind(folder_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LakeError::FolderNotFound(folder_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    fn meta(project: &str, author: &str) -> UploadMetadata {
        UploadMetadata {
            project: project.to_string(),
            author: author.to_string(),
            experiment_type: Some("ephys".to_string()),
            date_conducted: None,
            tags: vec!["cortex".to_string()],
            notes: None,
            name: None,
        }
    }

    async fn service() -> FolderService {
        FolderService::new(Arc::new(connect_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn new_folder_starts_empty_and_immutable() {
        let folders = service().await;
        let folder = folders
            .create_or_get_folder("Session 1", &meta("FS1", "ana"))
            .await
            .unwrap();

        assert_eq!(folder.key_prefix, "FS1/Session_1/");
        assert_eq!(folder.file_count, 0);
        assert_eq!(folder.total_size, 0);
        assert!(folder.immutable);
        assert_eq!(folder.tags.0, vec!["cortex"]);
    }

    #[tokio::test]
    async fn same_identity_returns_same_folder() {
        let folders = service().await;
        let first = folders
            .create_or_get_folder("run", &meta("FS1", "ana"))
            .await
            .unwrap();
        let second = folders
            .create_or_get_folder("run", &meta("FS1", "ana"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn colliding_prefixes_are_disambiguated() {
        let folders = service().await;
        let a = folders
            .create_or_get_folder("my data", &meta("FS1", "ana"))
            .await
            .unwrap();
        let b = folders
            .create_or_get_folder("my_data", &meta("FS1", "ana"))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.key_prefix, "FS1/my_data/");
        assert_eq!(b.key_prefix, "FS1/my_data_1/");
    }

    #[tokio::test]
    async fn same_name_in_other_project_is_a_different_folder() {
        let folders = service().await;
        let a = folders.create_or_get_folder("run", &meta("FS1", "ana")).await.unwrap();
        let b = folders.create_or_get_folder("run", &meta("FS2", "ana")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.key_prefix, "FS2/run/");
    }

    #[tokio::test]
    async fn record_file_added_on_unknown_folder_fails() {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let err = FolderService::record_file_added(&mut conn, Uuid::new_v4(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_folder_is_not_found() {
        let folders = service().await;
        assert!(matches!(
            folders.get_folder(Uuid::new_v4()).await,
            Err(LakeError::NotFound(_))
        ));
    }
}
