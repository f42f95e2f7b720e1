//! DataLakeService: upload, download and export orchestration.
//!
//! Uploads validate everything up front, then write the object first and the
//! index row second. If indexing fails the freshly written object is deleted
//! on a best-effort basis; a failed delete leaves an orphan object, never an
//! index row pointing at missing bytes.

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    archive::ArchiveExporter,
    error::{LakeError, LakeResult},
    folder_service::FolderService,
    index_writer::FileIndexWriter,
    key_allocator::{CollisionStyle, KeyAllocator},
    metadata::{UploadMode, parse_metadata},
    naming::{content_type_for, file_extension, project_segment, sanitize_filename, split_stem_ext},
    object_store::{ObjectReader, ObjectStore, ObjectStoreError, bytes_body},
    search::SearchEngine,
    spool::{SpooledFile, default_spool_dir},
    zip_ingest,
};
use crate::models::{
    file_record::{FileRecord, NewFileRecord},
    folder::Folder,
};

/// Tunables for the upload path.
#[derive(Debug, Clone)]
pub struct LakeSettings {
    /// Bucket that receives every upload.
    pub bucket: String,
    /// Create-only write attempts per file before a conflict is reported.
    pub key_attempts: u32,
    /// Retries for a failed existence check.
    pub storage_retries: u32,
    /// Scratch directory for uploads in flight.
    pub spool_dir: PathBuf,
    /// Decompressed bytes allowed per folder archive.
    pub max_unpacked_bytes: u64,
}

impl Default for LakeSettings {
    fn default() -> Self {
        Self {
            bucket: "raw-data".to_string(),
            key_attempts: 5,
            storage_retries: 3,
            spool_dir: default_spool_dir(),
            max_unpacked_bytes: 16 * 1024 * 1024 * 1024,
        }
    }
}

/// One uploaded multipart file, spooled to disk.
#[derive(Debug)]
pub struct UploadedPart {
    pub filename: String,
    pub content_type: Option<String>,
    pub body: SpooledFile,
}

#[derive(Debug, Serialize)]
pub struct FileUploadResponse {
    pub status: &'static str,
    pub original_filename: String,
    pub final_object_name: String,
    pub file_id: Uuid,
    pub message: &'static str,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FolderUploadStats {
    pub uploaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct FolderUploadResponse {
    pub folder: Folder,
    pub stats: FolderUploadStats,
}

/// An indexed file together with an open reader over its bytes.
pub struct Download {
    pub record: FileRecord,
    pub reader: ObjectReader,
}

#[derive(Clone)]
pub struct DataLakeService {
    db: Arc<SqlitePool>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    spool_dir: PathBuf,
    max_unpacked_bytes: u64,
    pub folders: FolderService,
    pub index: FileIndexWriter,
    pub allocator: KeyAllocator,
    pub search: SearchEngine,
    pub exporter: ArchiveExporter,
}

impl DataLakeService {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>, settings: LakeSettings) -> Self {
        let folders = FolderService::new(db.clone());
        Self {
            index: FileIndexWriter::new(db.clone()),
            allocator: KeyAllocator::new(
                db.clone(),
                store.clone(),
                settings.bucket.clone(),
                settings.key_attempts,
                settings.storage_retries,
            ),
            search: SearchEngine::new(db.clone()),
            exporter: ArchiveExporter::new(folders.clone(), store.clone()),
            folders,
            bucket: settings.bucket,
            spool_dir: settings.spool_dir,
            max_unpacked_bytes: settings.max_unpacked_bytes,
            store,
            db,
        }
    }

    /// Where request bodies are parked before they are published.
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Store a single standalone file under `<project>/`.
    pub async fn upload_file(&self, part: UploadedPart, metadata: &[u8]) -> LakeResult<FileUploadResponse> {
        let meta = parse_metadata(metadata, UploadMode::SingleFile)?;

        let original_filename = part.filename;
        let stored_name = sanitize_filename(&original_filename);
        let content_type = content_type_for(&original_filename, part.content_type.as_deref());
        let prefix = format!("{}/", project_segment(&meta.project));

        let stored = self
            .allocator
            .store_new(&prefix, &stored_name, CollisionStyle::Compact, Some(&content_type), &part.body)
            .await?;

        let record = self
            .index_or_discard(NewFileRecord {
                folder_id: None,
                bucket: self.bucket.clone(),
                object_name: stored.object_name,
                relative_path: None,
                extension: Some(file_extension(&original_filename)),
                original_filename,
                stored_filename: stored.stored_filename,
                content_type: Some(content_type),
                size_bytes: stored.size_bytes,
                checksum_etag: Some(stored.etag),
                metadata: meta.snapshot(),
            })
            .await?;

        Ok(FileUploadResponse {
            status: "success",
            original_filename: record.original_filename,
            final_object_name: record.object_name,
            file_id: record.file_id,
            message: "Metadata stored successfully.",
        })
    }

    /// Unpack a zip into a folder, creating the folder on first use.
    ///
    /// The display name is the explicit `name` argument, else the metadata's
    /// `name`, else the archive's file stem.
    pub async fn upload_folder(
        &self,
        archive: UploadedPart,
        metadata: &[u8],
        name: Option<String>,
    ) -> LakeResult<FolderUploadResponse> {
        let meta = parse_metadata(metadata, UploadMode::Folder)?;
        let unpacked =
            zip_ingest::unpack(&archive.body, &self.spool_dir, self.max_unpacked_bytes).await?;
        drop(archive.body);

        let name = name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| meta.name.clone())
            .unwrap_or_else(|| split_stem_ext(&archive.filename).0.to_string());

        let folder = self.folders.create_or_get_folder(&name, &meta).await?;
        let snapshot = folder.snapshot();

        let mut uploaded = 0;
        for entry in unpacked.entries {
            let (dir, basename) = match entry.relative_path.rsplit_once('/') {
                Some((dir, base)) => (Some(dir), base),
                None => (None, entry.relative_path.as_str()),
            };
            let prefix = match dir {
                Some(dir) => format!("{}{}/", folder.key_prefix, dir),
                None => folder.key_prefix.clone(),
            };
            let content_type = content_type_for(basename, None);

            let stored = self
                .allocator
                .store_new(&prefix, basename, CollisionStyle::Spaced, Some(&content_type), &entry.body)
                .await?;

            let relative_path = match dir {
                Some(dir) => format!("{}/{}", dir, stored.stored_filename),
                None => stored.stored_filename.clone(),
            };

            self.index_or_discard(NewFileRecord {
                folder_id: Some(folder.id),
                bucket: self.bucket.clone(),
                object_name: stored.object_name,
                relative_path: Some(relative_path),
                extension: Some(file_extension(&entry.original_filename)),
                original_filename: entry.original_filename,
                stored_filename: stored.stored_filename,
                content_type: Some(content_type),
                size_bytes: stored.size_bytes,
                checksum_etag: Some(stored.etag),
                metadata: snapshot.clone(),
            })
            .await?;
            uploaded += 1;
        }

        let folder = self.folders.get_folder(folder.id).await?;
        info!(
            "folder upload into {} ({}): {} stored, {} skipped",
            folder.id, folder.key_prefix, uploaded, unpacked.skipped
        );

        Ok(FolderUploadResponse {
            folder,
            stats: FolderUploadStats {
                uploaded,
                skipped: unpacked.skipped,
            },
        })
    }

    /// Index an already-written object; on failure try to remove the object
    /// again so no unreferenced bytes stay behind.
    async fn index_or_discard(&self, entry: NewFileRecord) -> LakeResult<FileRecord> {
        let bucket = entry.bucket.clone();
        let object_name = entry.object_name.clone();
        match self.index.index_file(entry).await {
            Ok(record) => Ok(record),
            Err(err) => {
                if let Err(cleanup) = self.store.delete(&bucket, &object_name).await {
                    warn!(
                        "index write failed and orphan `{}` could not be removed: {}",
                        object_name, cleanup
                    );
                } else {
                    warn!("index write failed; removed object `{}`", object_name);
                }
                Err(err)
            }
        }
    }

    /// Resolve `raw_id` to its record and an open reader over the bytes.
    pub async fn download(&self, raw_id: &str) -> LakeResult<Download> {
        let not_found = || LakeError::NotFound(format!("File with ID {} not found.", raw_id));

        let file_id = Uuid::parse_str(raw_id.trim()).map_err(|_| not_found())?;
        let record = self.search.get_file(file_id).await?.ok_or_else(not_found)?;

        match self.store.open(&record.bucket, &record.object_name).await {
            Ok(reader) => Ok(Download { record, reader }),
            Err(ObjectStoreError::NotFound { .. }) => {
                warn!(
                    "file {} is indexed but `{}` is missing from storage",
                    record.file_id, record.object_name
                );
                Err(LakeError::NotFound(
                    "File record found, but data does not exist in storage.".to_string(),
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Files of an existing folder, ordered by relative path.
    pub async fn folder_files(&self, folder_id: Uuid) -> LakeResult<Vec<FileRecord>> {
        self.folders.get_folder(folder_id).await?;
        self.folders.list_files(folder_id).await
    }

    /// Plan, verify and start streaming a folder export. Returns the
    /// attachment filename and the body stream.
    pub async fn export_zip(
        &self,
        folder_id: Uuid,
        subpath: Option<&str>,
    ) -> LakeResult<(String, impl Stream<Item = io::Result<Bytes>> + Send + 'static)> {
        let plan = self.exporter.plan_export(folder_id, subpath).await?;
        self.exporter.verify(&plan).await?;
        let filename = plan.filename.clone();
        Ok((filename, self.exporter.stream_zip(plan)))
    }

    pub async fn check_database(&self) -> LakeResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(LakeError::Internal(format!("unexpected probe result {}", one)));
        }
        Ok(())
    }

    /// Create and delete a probe object in the upload bucket.
    pub async fn check_storage(&self) -> LakeResult<()> {
        let probe = format!("_readyz/{}", Uuid::new_v4());
        self.store
            .put_new(&self.bucket, &probe, None, bytes_body(Bytes::from_static(b"ok")))
            .await?;
        self.store.delete(&self.bucket, &probe).await?;
        Ok(())
    }
}
