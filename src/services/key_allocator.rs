//! Collision-safe object key allocation.
//!
//! A key is free when neither the index nor the object store knows it. The
//! store check is authoritative for races: the write itself is create-only,
//! so a concurrent upload that claimed the same key makes `put_new` fail and
//! the allocator moves on to the next candidate name. Payloads come from the
//! spool, so a retry replays the file from disk rather than from memory.

use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::warn;

use super::{
    error::{LakeError, LakeResult},
    naming::split_stem_ext,
    object_store::{ObjectStore, ObjectStoreError},
    spool::SpooledFile,
};

/// Candidate names probed per allocation before reporting a conflict.
const MAX_PROBES: u32 = 10_000;

/// How the disambiguating counter is spliced into a filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionStyle {
    /// `data(1).csv`
    Compact,
    /// `data (1).csv`
    Spaced,
}

/// The `n`th candidate for `filename`; `n == 0` is the filename itself.
pub fn candidate_name(filename: &str, n: u32, style: CollisionStyle) -> String {
    if n == 0 {
        return filename.to_string();
    }
    let (stem, ext) = split_stem_ext(filename);
    let counter = match style {
        CollisionStyle::Compact => format!("{}({})", stem, n),
        CollisionStyle::Spaced => format!("{} ({})", stem, n),
    };
    match ext {
        Some(ext) => format!("{}.{}", counter, ext),
        None => counter,
    }
}

/// Result of a successful allocate-and-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub object_name: String,
    pub stored_filename: String,
    pub size_bytes: i64,
    pub etag: String,
}

#[derive(Clone)]
pub struct KeyAllocator {
    db: Arc<SqlitePool>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_attempts: u32,
    storage_retries: u32,
}

impl KeyAllocator {
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_attempts: u32,
        storage_retries: u32,
    ) -> Self {
        Self {
            db,
            store,
            bucket: bucket.into(),
            key_attempts: key_attempts.max(1),
            storage_retries,
        }
    }

    /// First free key `prefix + candidate_name(filename, n)` with `n >= start`.
    pub async fn allocate(
        &self,
        prefix: &str,
        filename: &str,
        style: CollisionStyle,
        start: u32,
    ) -> LakeResult<(String, u32)> {
        for n in start..start.saturating_add(MAX_PROBES) {
            let key = format!("{}{}", prefix, candidate_name(filename, n, style));
            if !self.is_taken(&key).await? {
                return Ok((key, n));
            }
        }
        Err(LakeError::Conflict {
            prefix: prefix.to_string(),
            attempts: MAX_PROBES,
        })
    }

    /// Allocate a key under `prefix` and write `payload` to it, retrying with
    /// the next candidate whenever a concurrent writer wins the key.
    pub async fn store_new(
        &self,
        prefix: &str,
        filename: &str,
        style: CollisionStyle,
        content_type: Option<&str>,
        payload: &SpooledFile,
    ) -> LakeResult<StoredObject> {
        let mut start = 0;
        for attempt in 1..=self.key_attempts {
            let (key, n) = self.allocate(prefix, filename, style, start).await?;
            let body = payload
                .stream()
                .await
                .map_err(|err| LakeError::Internal(format!("reading spooled upload: {}", err)))?;
            match self.store.put_new(&self.bucket, &key, content_type, body).await
            {
                Ok(outcome) => {
                    return Ok(StoredObject {
                        stored_filename: candidate_name(filename, n, style),
                        object_name: key,
                        size_bytes: outcome.size_bytes,
                        etag: outcome.etag,
                    });
                }
                Err(ObjectStoreError::AlreadyExists { key, .. }) => {
                    warn!(
                        "key `{}` claimed by a concurrent upload (attempt {}/{})",
                        key, attempt, self.key_attempts
                    );
                    start = n + 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LakeError::Conflict {
            prefix: prefix.to_string(),
            attempts: self.key_attempts,
        })
    }

    async fn is_taken(&self, key: &str) -> LakeResult<bool> {
        let indexed: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM file_index WHERE bucket = ? AND object_name = ?")
                .bind(&self.bucket)
                .bind(key)
                .fetch_optional(&*self.db)
                .await?;
        if indexed.is_some() {
            return Ok(true);
        }
        self.exists_with_retry(key).await
    }

    async fn exists_with_retry(&self, key: &str) -> LakeResult<bool> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.exists(&self.bucket, key).await {
                Ok(found) => return Ok(found),
                Err(err @ ObjectStoreError::InvalidKey(_)) => return Err(err.into()),
                Err(err) if attempt < self.storage_retries => {
                    warn!("existence check for `{}` failed, retrying: {}", key, err);
                    tokio::time::sleep(Duration::from_millis(25u64 << attempt.min(6))).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(LakeError::StorageUnavailable(format!(
                        "existence check for `{}` failed after {} attempts: {}",
                        key,
                        attempt + 1,
                        err
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::connect_in_memory,
        services::{
            object_store::{
                ByteStream, LocalObjectStore, ObjectReader, ObjectStoreResult, PutOutcome, bytes_body,
            },
            spool::tests::spool_bytes,
        },
    };
    use bytes::Bytes;
    use async_trait::async_trait;
    use std::{
        io,
        sync::atomic::{AtomicU32, Ordering},
    };
    use tempfile::TempDir;

    /// Loses every race.
    struct AlwaysConflicting;

    #[async_trait]
    impl ObjectStore for AlwaysConflicting {
        async fn exists(&self, _: &str, _: &str) -> ObjectStoreResult<bool> {
            Ok(false)
        }
        async fn put_new(
            &self,
            bucket: &str,
            key: &str,
            _: Option<&str>,
            _: ByteStream,
        ) -> ObjectStoreResult<PutOutcome> {
            Err(ObjectStoreError::AlreadyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }
        async fn open(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
            Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }
        async fn delete(&self, _: &str, _: &str) -> ObjectStoreResult<()> {
            Ok(())
        }
    }

    /// Cannot answer existence checks.
    struct Unreachable {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for Unreachable {
        async fn exists(&self, _: &str, _: &str) -> ObjectStoreResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::TimedOut, "backend timed out").into())
        }
        async fn put_new(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: ByteStream,
        ) -> ObjectStoreResult<PutOutcome> {
            Err(io::Error::other("unreachable").into())
        }
        async fn open(&self, _: &str, _: &str) -> ObjectStoreResult<ObjectReader> {
            Err(io::Error::other("unreachable").into())
        }
        async fn delete(&self, _: &str, _: &str) -> ObjectStoreResult<()> {
            Err(io::Error::other("unreachable").into())
        }
    }

    /// Local store where another writer sneaks in ahead of the first put.
    struct RacedOnce {
        inner: LocalObjectStore,
        raced: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for RacedOnce {
        async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool> {
            self.inner.exists(bucket, key).await
        }
        async fn put_new(
            &self,
            bucket: &str,
            key: &str,
            content_type: Option<&str>,
            body: ByteStream,
        ) -> ObjectStoreResult<PutOutcome> {
            if self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner
                    .put_new(bucket, key, None, bytes_body(Bytes::from_static(b"rival")))
                    .await?;
            }
            self.inner.put_new(bucket, key, content_type, body).await
        }
        async fn open(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
            self.inner.open(bucket, key).await
        }
        async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
            self.inner.delete(bucket, key).await
        }
    }

    async fn allocator(store: Arc<dyn ObjectStore>) -> KeyAllocator {
        let db = Arc::new(connect_in_memory().await.unwrap());
        KeyAllocator::new(db, store, "raw-data", 3, 2)
    }

    #[test]
    fn candidate_names() {
        assert_eq!(candidate_name("data.csv", 0, CollisionStyle::Compact), "data.csv");
        assert_eq!(candidate_name("data.csv", 2, CollisionStyle::Compact), "data(2).csv");
        assert_eq!(candidate_name("data.csv", 1, CollisionStyle::Spaced), "data (1).csv");
        assert_eq!(candidate_name("README", 3, CollisionStyle::Compact), "README(3)");
    }

    #[tokio::test]
    async fn existing_object_gets_a_suffixed_key() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(Arc::new(LocalObjectStore::new(dir.path()))).await;

        let first = alloc
            .store_new("FS1/", "data.csv", CollisionStyle::Compact, None, &spool_bytes(dir.path(), b"1").await)
            .await
            .unwrap();
        let second = alloc
            .store_new("FS1/", "data.csv", CollisionStyle::Compact, None, &spool_bytes(dir.path(), b"22").await)
            .await
            .unwrap();

        assert_eq!(first.object_name, "FS1/data.csv");
        assert_eq!(second.object_name, "FS1/data(1).csv");
        assert_eq!(second.stored_filename, "data(1).csv");
        assert_eq!(second.size_bytes, 2);
    }

    #[tokio::test]
    async fn indexed_key_counts_as_taken_even_without_object() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(Arc::new(LocalObjectStore::new(dir.path()))).await;
        sqlx::query(
            "INSERT INTO file_index (file_id, bucket, object_name, original_filename,
                stored_filename, size_bytes, created_at, project, author)
             VALUES (?, 'raw-data', 'FS1/data.csv', 'data.csv', 'data.csv', 0, ?, 'FS1', 'ana')",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(chrono::Utc::now())
        .execute(&*alloc.db)
        .await
        .unwrap();

        let (key, n) = alloc
            .allocate("FS1/", "data.csv", CollisionStyle::Compact, 0)
            .await
            .unwrap();
        assert_eq!((key.as_str(), n), ("FS1/data(1).csv", 1));
    }

    #[tokio::test]
    async fn lost_race_moves_to_next_candidate() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RacedOnce {
            inner: LocalObjectStore::new(dir.path()),
            raced: AtomicU32::new(0),
        });
        let alloc = allocator(store.clone()).await;

        let stored = alloc
            .store_new("p/", "x.bin", CollisionStyle::Compact, None, &spool_bytes(dir.path(), b"mine").await)
            .await
            .unwrap();
        assert_eq!(stored.object_name, "p/x(1).bin");
        assert_eq!(stored.size_bytes, 4);
        assert_eq!(stored.etag, format!("{:x}", md5::compute(b"mine")));

        // The retry replayed the spooled payload in full.
        let mut reader = store.open("raw-data", "p/x(1).bin").await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"mine");
    }

    #[tokio::test]
    async fn exhausted_retries_are_a_conflict() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(Arc::new(AlwaysConflicting)).await;
        let err = alloc
            .store_new("p/", "x.bin", CollisionStyle::Compact, None, &spool_bytes(dir.path(), b"x").await)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::Conflict { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn unreachable_store_is_storage_unavailable_after_retries() {
        let store = Arc::new(Unreachable {
            calls: AtomicU32::new(0),
        });
        let alloc = allocator(store.clone()).await;
        let err = alloc
            .allocate("p/", "x.bin", CollisionStyle::Compact, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::StorageUnavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
