//! Streaming zip export of a folder or one of its subtrees.
//!
//! Entries are written in the order the index lists them (by relative path)
//! and copied straight from the object store into the deflate encoder, so the
//! archive is never held in memory. Every object is checked before the first
//! byte goes out; a read failure after that point aborts the body instead of
//! yielding a zip with holes in it.

use async_zip::{Compression, ZipEntryBuilder, tokio::write::ZipFileWriter};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::{io, sync::Arc};
use tokio::io::{AsyncWrite, DuplexStream};
use tokio_util::{compat::TokioAsyncReadCompatExt, io::ReaderStream};
use tracing::{error, info};
use uuid::Uuid;

use super::{
    error::{LakeError, LakeResult},
    folder_service::FolderService,
    naming::name_segment,
    object_store::ObjectStore,
};
use crate::models::file_record::FileRecord;

/// Buffer between the zip writer task and the HTTP body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Resolved contents of one export.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Suggested attachment filename, e.g. `session_1.zip`.
    pub filename: String,
    pub files: Vec<FileRecord>,
}

#[derive(Clone)]
pub struct ArchiveExporter {
    folders: FolderService,
    store: Arc<dyn ObjectStore>,
}

impl ArchiveExporter {
    pub fn new(folders: FolderService, store: Arc<dyn ObjectStore>) -> Self {
        Self { folders, store }
    }

    /// Select the files to export. With a subpath, only files whose relative
    /// path lies under it are included.
    pub async fn plan_export(&self, folder_id: Uuid, subpath: Option<&str>) -> LakeResult<ExportPlan> {
        let folder = self.folders.get_folder(folder_id).await?;
        let subpath = subpath.and_then(normalize_subpath);

        let files: Vec<FileRecord> = self
            .folders
            .list_files(folder_id)
            .await?
            .into_iter()
            .filter(|f| match (&subpath, f.relative_path.as_deref()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(prefix), Some(rel)) => rel.starts_with(prefix.as_str()),
            })
            .collect();

        if files.is_empty() {
            return Err(LakeError::NotFound(
                "No files found for this folder/subpath.".to_string(),
            ));
        }

        let label = match &subpath {
            Some(prefix) => prefix
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("subfolder")
                .to_string(),
            None => name_segment(&folder.name),
        };

        Ok(ExportPlan {
            filename: format!("{}.zip", label),
            files,
        })
    }

    /// Confirm every planned object is still present.
    pub async fn verify(&self, plan: &ExportPlan) -> LakeResult<()> {
        for file in &plan.files {
            let present = self
                .store
                .exists(&file.bucket, &file.object_name)
                .await
                .map_err(|err| LakeError::ExportIncomplete {
                    object_name: file.object_name.clone(),
                    reason: err.to_string(),
                })?;
            if !present {
                return Err(LakeError::ExportIncomplete {
                    object_name: file.object_name.clone(),
                    reason: "object missing from storage".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Write the whole archive into `writer` and hand the writer back.
    pub async fn write_zip<W>(&self, plan: &ExportPlan, writer: W) -> LakeResult<W>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut zip = ZipFileWriter::with_tokio(writer);

        for file in &plan.files {
            let Some(entry_name) = file.relative_path.clone() else {
                continue;
            };
            let incomplete = |reason: String| LakeError::ExportIncomplete {
                object_name: file.object_name.clone(),
                reason,
            };

            let reader = self
                .store
                .open(&file.bucket, &file.object_name)
                .await
                .map_err(|err| incomplete(err.to_string()))?;

            let builder = ZipEntryBuilder::new(entry_name.into(), Compression::Deflate);
            let mut entry = zip
                .write_entry_stream(builder)
                .await
                .map_err(|err| incomplete(err.to_string()))?;
            futures::io::copy(reader.compat(), &mut entry)
                .await
                .map_err(|err| incomplete(err.to_string()))?;
            entry.close().await.map_err(|err| incomplete(err.to_string()))?;
        }

        let inner = zip
            .close()
            .await
            .map_err(|err| LakeError::Internal(format!("finishing zip archive: {}", err)))?;
        Ok(inner.into_inner())
    }

    /// Stream the archive as body chunks. Writing happens on a separate task;
    /// if it fails the stream ends with an error item rather than a clean EOF.
    pub fn stream_zip(&self, plan: ExportPlan) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let (pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let exporter = self.clone();

        let task = tokio::spawn(async move {
            let entries = plan.files.len();
            let filename = plan.filename.clone();
            match exporter.write_zip::<DuplexStream>(&plan, pipe_writer).await {
                Ok(_) => {
                    info!("exported {} files as {}", entries, filename);
                    Ok(())
                }
                Err(err) => {
                    error!("zip export {} aborted: {}", filename, err);
                    Err(err)
                }
            }
        });

        let trailer = stream::once(async move {
            match task.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Err(io::Error::other(err.to_string()))),
                Err(join) => Some(Err(io::Error::other(format!("zip export task failed: {}", join)))),
            }
        })
        .filter_map(|item| async move { item });

        ReaderStream::new(pipe_reader).chain(trailer)
    }
}

/// Normalise a user subpath to `a/b/`, or `None` when it selects everything.
fn normalize_subpath(raw: &str) -> Option<String> {
    let cleaned = raw.trim().replace('\\', "/");
    let cleaned = cleaned.trim_matches('/');
    if cleaned.is_empty() {
        None
    } else {
        Some(format!("{}/", cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::connect_in_memory,
        models::{file_record::NewFileRecord, folder::Folder},
        services::{
            index_writer::FileIndexWriter,
            metadata::UploadMetadata,
            object_store::{LocalObjectStore, bytes_body},
        },
    };
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<LocalObjectStore>,
        folders: FolderService,
        writer: FileIndexWriter,
        exporter: ArchiveExporter,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let db = Arc::new(connect_in_memory().await.unwrap());
        let folders = FolderService::new(db.clone());
        Fixture {
            exporter: ArchiveExporter::new(folders.clone(), store.clone()),
            writer: FileIndexWriter::new(db),
            folders,
            store,
            _dir: dir,
        }
    }

    async fn folder(fx: &Fixture, name: &str) -> Folder {
        let meta = UploadMetadata {
            project: "FS1".into(),
            author: "ana".into(),
            experiment_type: None,
            date_conducted: None,
            tags: vec![],
            notes: None,
            name: None,
        };
        fx.folders.create_or_get_folder(name, &meta).await.unwrap()
    }

    async fn put(fx: &Fixture, folder: &Folder, rel: &str, data: &'static [u8]) {
        let key = format!("{}{}", folder.key_prefix, rel);
        let out = fx
            .store
            .put_new("raw-data", &key, None, bytes_body(Bytes::from_static(data)))
            .await
            .unwrap();
        fx.writer
            .index_file(NewFileRecord {
                folder_id: Some(folder.id),
                bucket: "raw-data".into(),
                object_name: key,
                relative_path: Some(rel.into()),
                original_filename: rel.rsplit('/').next().unwrap().into(),
                stored_filename: rel.rsplit('/').next().unwrap().into(),
                extension: None,
                content_type: None,
                size_bytes: out.size_bytes,
                checksum_etag: Some(out.etag),
                metadata: folder.snapshot(),
            })
            .await
            .unwrap();
    }

    fn read_zip(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                (file.name().to_string(), data)
            })
            .collect()
    }

    #[tokio::test]
    async fn whole_folder_round_trips_through_zip() {
        let fx = fixture().await;
        let f = folder(&fx, "Session 1").await;
        put(&fx, &f, "ds/b.txt", b"bravo").await;
        put(&fx, &f, "ds/a.txt", b"alpha").await;
        put(&fx, &f, "ds/sub/c.csv", b"1,2").await;

        let plan = fx.exporter.plan_export(f.id, None).await.unwrap();
        assert_eq!(plan.filename, "Session_1.zip");
        fx.exporter.verify(&plan).await.unwrap();

        let bytes = fx.exporter.write_zip(&plan, Vec::new()).await.unwrap();
        let entries = read_zip(bytes);
        assert_eq!(
            entries,
            vec![
                ("ds/a.txt".to_string(), b"alpha".to_vec()),
                ("ds/b.txt".to_string(), b"bravo".to_vec()),
                ("ds/sub/c.csv".to_string(), b"1,2".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn subpath_limits_entries_and_names_the_archive() {
        let fx = fixture().await;
        let f = folder(&fx, "run").await;
        put(&fx, &f, "ds/a.txt", b"a").await;
        put(&fx, &f, "ds/sub1/x.txt", b"x").await;
        put(&fx, &f, "ds/sub10/y.txt", b"y").await;

        let plan = fx.exporter.plan_export(f.id, Some(" /ds\\sub1 ")).await.unwrap();
        assert_eq!(plan.filename, "sub1.zip");
        let paths: Vec<_> = plan.files.iter().filter_map(|f| f.relative_path.clone()).collect();
        assert_eq!(paths, vec!["ds/sub1/x.txt"]);

        let err = fx.exporter.plan_export(f.id, Some("nope")).await.unwrap_err();
        assert!(matches!(err, LakeError::NotFound(msg) if msg == "No files found for this folder/subpath."));
    }

    #[tokio::test]
    async fn unknown_folder_is_not_found() {
        let fx = fixture().await;
        let err = fx.exporter.plan_export(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, LakeError::NotFound(msg) if msg == "Folder not found."));
    }

    #[tokio::test]
    async fn missing_object_fails_verification_and_streaming() {
        let fx = fixture().await;
        let f = folder(&fx, "run").await;
        put(&fx, &f, "a.txt", b"a").await;
        put(&fx, &f, "b.txt", b"b").await;
        fx.store
            .delete("raw-data", &format!("{}b.txt", f.key_prefix))
            .await
            .unwrap();

        let plan = fx.exporter.plan_export(f.id, None).await.unwrap();
        let err = fx.exporter.verify(&plan).await.unwrap_err();
        assert!(matches!(err, LakeError::ExportIncomplete { ref object_name, .. } if object_name == "FS1/run/b.txt"));

        let mut body = Box::pin(fx.exporter.stream_zip(plan));
        let mut saw_error = false;
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn streamed_body_is_a_complete_zip() {
        let fx = fixture().await;
        let f = folder(&fx, "run").await;
        put(&fx, &f, "a.txt", b"streamed").await;

        let plan = fx.exporter.plan_export(f.id, None).await.unwrap();
        let chunks: Vec<io::Result<Bytes>> = fx.exporter.stream_zip(plan).collect().await;
        let mut bytes = Vec::new();
        for chunk in chunks {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(read_zip(bytes), vec![("a.txt".to_string(), b"streamed".to_vec())]);
    }
}
