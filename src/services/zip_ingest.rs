//! Unpacking of uploaded folder archives.
//!
//! Entries are decompressed one at a time into spool files, never into
//! memory, and the sum of their decompressed sizes is capped so a small
//! archive cannot expand without bound.

use std::{fs::File, io::BufReader, path::Path};
use tracing::debug;
use zip::ZipArchive;

use super::{
    error::{LakeError, LakeResult, ValidationError},
    naming::{is_system_artifact, sanitize_relative_path},
    spool::{SpoolError, SpooledFile, copy_capped},
};

/// One regular file taken from the archive.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Sanitised path inside the folder, `/`-separated.
    pub relative_path: String,
    /// Last path segment as it appeared in the archive.
    pub original_filename: String,
    pub body: SpooledFile,
}

#[derive(Debug, Default)]
pub struct UnpackedArchive {
    pub entries: Vec<ArchiveEntry>,
    /// Entries dropped as OS litter or because their path was unusable.
    pub skipped: usize,
}

/// Read every regular file out of `archive` into `spool_dir`. Directory
/// entries are ignored, system artifacts and unsafe paths are counted as
/// skipped. Decompressed bytes across all entries may not exceed `budget`.
///
/// The archive is fully unpacked before anything is published, so a corrupt
/// upload never produces a partial folder.
pub async fn unpack(archive: &SpooledFile, spool_dir: &Path, budget: u64) -> LakeResult<UnpackedArchive> {
    let archive_path = archive.path().to_path_buf();
    let spool_dir = spool_dir.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive_path, &spool_dir, budget))
        .await
        .map_err(|err| LakeError::Internal(format!("archive task failed: {}", err)))?
}

fn unpack_blocking(archive_path: &Path, spool_dir: &Path, budget: u64) -> LakeResult<UnpackedArchive> {
    let file = File::open(archive_path)
        .map_err(|err| LakeError::Internal(format!("spooled archive unreadable: {}", err)))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|err| {
        debug!("rejecting upload archive: {}", err);
        ValidationError::new("The uploaded file is not a valid ZIP archive.")
    })?;

    let mut remaining = budget;
    let mut unpacked = UnpackedArchive::default();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|err| {
            ValidationError::new(format!("Unreadable entry #{} in ZIP archive: {}", i, err))
        })?;
        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        if is_system_artifact(&raw_name) {
            unpacked.skipped += 1;
            continue;
        }
        let Some(relative_path) = sanitize_relative_path(&raw_name) else {
            debug!("skipping archive entry with unusable path '{}'", raw_name);
            unpacked.skipped += 1;
            continue;
        };

        // The declared size in the header is not trusted; the copy itself
        // enforces what is left of the budget.
        let body = copy_capped(spool_dir, entry, remaining).map_err(|err| match err {
            SpoolError::TooLarge { .. } => LakeError::from(ValidationError::new(format!(
                "The ZIP archive expands beyond the allowed {} bytes.",
                budget
            ))),
            SpoolError::Read(err) => LakeError::from(ValidationError::new(format!(
                "Failed to read '{}' from ZIP archive: {}",
                raw_name, err
            ))),
            SpoolError::Write(err) => LakeError::Internal(format!("spooling archive entry: {}", err)),
        })?;
        remaining -= body.size_bytes();

        let original_filename = raw_name
            .replace('\\', "/")
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        unpacked.entries.push(ArchiveEntry {
            relative_path,
            original_filename,
            body,
        });
    }

    Ok(unpacked)
}
