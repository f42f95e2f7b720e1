//! Upload payloads parked on local disk until they are published.
//!
//! Request bodies and archive entries are written here chunk by chunk, so
//! memory use stays flat no matter how large an upload is. A spooled file is
//! removed when its handle is dropped.

use futures::StreamExt;
use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use tempfile::{Builder, TempPath};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::object_store::ByteStream;

const COPY_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    /// The source could not be read (corrupt archive entry, broken body).
    #[error("reading payload: {0}")]
    Read(io::Error),
    /// The spool directory could not be written.
    #[error("writing spool file: {0}")]
    Write(io::Error),
}

/// A finished payload on disk.
#[derive(Debug)]
pub struct SpooledFile {
    path: TempPath,
    len: u64,
}

impl SpooledFile {
    pub fn size_bytes(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh stream over the contents; every call starts from the beginning.
    pub async fn stream(&self) -> io::Result<ByteStream> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(ReaderStream::with_capacity(file, COPY_BUF_LEN).boxed())
    }
}

fn create_in(dir: &Path) -> io::Result<(fs::File, TempPath)> {
    fs::create_dir_all(dir)?;
    let file = Builder::new().prefix(".upload-").tempfile_in(dir)?;
    Ok(file.into_parts())
}

/// Incremental async writer for request bodies.
pub struct SpoolWriter {
    file: tokio::fs::File,
    path: TempPath,
    len: u64,
}

impl SpoolWriter {
    pub fn create(dir: &Path) -> Result<Self, SpoolError> {
        let (file, path) = create_in(dir).map_err(SpoolError::Write)?;
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            len: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SpoolError> {
        self.file.write_all(chunk).await.map_err(SpoolError::Write)?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<SpooledFile, SpoolError> {
        self.file.flush().await.map_err(SpoolError::Write)?;
        Ok(SpooledFile {
            path: self.path,
            len: self.len,
        })
    }
}

/// Blocking copy of at most `limit` bytes from `reader` into a new spool
/// file under `dir`.
pub fn copy_capped<R: Read>(dir: &Path, reader: R, limit: u64) -> Result<SpooledFile, SpoolError> {
    let (mut file, path) = create_in(dir).map_err(SpoolError::Write)?;
    let mut reader = reader.take(limit.saturating_add(1));
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut len: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SpoolError::Read(err)),
        };
        len += n as u64;
        if len > limit {
            return Err(SpoolError::TooLarge { limit });
        }
        file.write_all(&buf[..n]).map_err(SpoolError::Write)?;
    }
    file.flush().map_err(SpoolError::Write)?;
    Ok(SpooledFile { path, len })
}

/// Default scratch location when none is configured.
pub fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("research-datalake-spool")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Spool an in-memory payload.
    pub(crate) async fn spool_bytes(dir: &Path, data: &[u8]) -> SpooledFile {
        let mut writer = SpoolWriter::create(dir).unwrap();
        writer.write(data).await.unwrap();
        writer.finish().await.unwrap()
    }

    async fn collect(file: &SpooledFile) -> Vec<u8> {
        let mut stream = file.stream().await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn chunks_land_on_disk_and_can_be_replayed() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpoolWriter::create(dir.path()).unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        let file = writer.finish().await.unwrap();

        assert_eq!(file.size_bytes(), 11);
        assert_eq!(collect(&file).await, b"hello world");
        assert_eq!(collect(&file).await, b"hello world");
        assert_eq!(tokio::fs::read(file.path()).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn dropping_the_handle_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let file = spool_bytes(dir.path(), b"x").await;
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn capped_copy_stops_at_the_limit() {
        let dir = TempDir::new().unwrap();
        let ok = copy_capped(dir.path(), &b"12345"[..], 5).unwrap();
        assert_eq!(ok.size_bytes(), 5);

        // An endless source must not be drained past the cap.
        let endless = io::repeat(b'z');
        assert!(matches!(
            copy_capped(dir.path(), endless, 1024),
            Err(SpoolError::TooLarge { limit: 1024 })
        ));
    }
}
