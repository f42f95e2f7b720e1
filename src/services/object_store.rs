//! Object storage capability used by the lake.
//!
//! The lake only needs four things from a bucket: check whether a key is
//! taken, create a key that must not exist yet, read it back as a stream and
//! delete it. `LocalObjectStore` implements that on local disk with payloads
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    AlreadyExists { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Payload handed to [`ObjectStore::put_new`].
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Streaming reader over a stored object.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// What the backend reports after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub size_bytes: i64,
    /// Hex MD5 of the payload.
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `key` currently holds an object.
    async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool>;

    /// Store `body` at `key`, failing with `AlreadyExists` instead of
    /// overwriting when another writer got there first.
    async fn put_new(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: ByteStream,
    ) -> ObjectStoreResult<PutOutcome>;

    async fn open(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader>;

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;
}

/// Wrap an in-memory payload as a [`ByteStream`].
pub fn bytes_body(payload: Bytes) -> ByteStream {
    futures::stream::once(async move { Ok(payload) }).boxed()
}

/// Disk-backed bucket storage.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.ends_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn ensure_bucket_safe(bucket: &str) -> ObjectStoreResult<()> {
        let valid = !bucket.is_empty()
            && bucket
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
            && !bucket.starts_with('.');
        if !valid {
            return Err(ObjectStoreError::InvalidKey(bucket.to_string()));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> ObjectStoreResult<PathBuf> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    /// Stream `body` into a temp file next to `tmp_path`, returning size and md5.
    async fn write_temp<S>(tmp_path: &Path, body: S) -> io::Result<PutOutcome>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut file = File::create(tmp_path).await?;
        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(PutOutcome {
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn put_new(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
        body: ByteStream,
    ) -> ObjectStoreResult<PutOutcome> {
        let file_path = self.object_path(bucket, key)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let outcome = match Self::write_temp(&tmp_path, body).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        };

        // A hard link is an atomic create-only publish: it never replaces an
        // existing object, unlike rename.
        let linked = fs::hard_link(&tmp_path, &file_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => {
                debug!("stored {}/{} ({} bytes)", bucket, key, outcome.size_bytes);
                Ok(outcome)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(ObjectStoreError::AlreadyExists {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn open(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
        let path = self.object_path(bucket, key)?;
        match File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            let root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn store() -> (TempDir, LocalObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_read_back_with_md5_etag() {
        let (_dir, store) = store();
        let outcome = store
            .put_new("raw-data", "FS1/data.csv", None, bytes_body(Bytes::from_static(b"a,b\n1,2\n")))
            .await
            .unwrap();

        assert_eq!(outcome.size_bytes, 8);
        assert_eq!(outcome.etag, format!("{:x}", md5::compute(b"a,b\n1,2\n")));
        assert!(store.exists("raw-data", "FS1/data.csv").await.unwrap());

        let mut reader = store.open("raw-data", "FS1/data.csv").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn put_new_never_overwrites() {
        let (_dir, store) = store();
        store
            .put_new("raw-data", "p/x.bin", None, bytes_body(Bytes::from_static(b"first")))
            .await
            .unwrap();

        let err = store
            .put_new("raw-data", "p/x.bin", None, bytes_body(Bytes::from_static(b"second")))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::AlreadyExists { .. }));

        let mut reader = store.open("raw-data", "p/x.bin").await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "first");
    }

    #[tokio::test]
    async fn delete_removes_object_and_empty_shards() {
        let (dir, store) = store();
        store
            .put_new("raw-data", "p/gone.txt", None, bytes_body(Bytes::from_static(b"x")))
            .await
            .unwrap();
        store.delete("raw-data", "p/gone.txt").await.unwrap();

        assert!(!store.exists("raw-data", "p/gone.txt").await.unwrap());
        assert!(matches!(
            store.open("raw-data", "p/gone.txt").await,
            Err(ObjectStoreError::NotFound { .. })
        ));
        let leftovers = std::fs::read_dir(dir.path().join("raw-data")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store();
        for key in ["../etc/passwd", "/abs", "a//b", "a/./b", "dir/"] {
            assert!(
                matches!(store.exists("raw-data", key).await, Err(ObjectStoreError::InvalidKey(_))),
                "{key} should be rejected"
            );
        }
    }
}
