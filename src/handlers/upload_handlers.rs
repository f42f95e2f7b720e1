//! Multipart upload handlers.
//!
//! File fields are streamed to the spool as they arrive; only the small
//! metadata and name fields are held in memory. The parts are then handed to
//! `DataLakeService`, which validates metadata before anything is published.

use crate::{
    errors::AppError,
    services::{
        lake_service::{DataLakeService, FileUploadResponse, FolderUploadResponse, UploadedPart},
        spool::{SpoolError, SpoolWriter, SpooledFile},
    },
};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartRejection},
    },
    http::StatusCode,
};
use bytes::{Bytes, BytesMut};
use std::{collections::HashMap, path::Path};
use tracing::{debug, warn};

/// Largest accepted metadata document or text field.
const MAX_TEXT_FIELD_BYTES: usize = 1024 * 1024;

/// `POST /uploadfile/` with `data_file` and `metadata_file`.
pub async fn upload_file(
    State(service): State<DataLakeService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<FileUploadResponse>, AppError> {
    let mut form = read_form(multipart?, service.spool_dir(), &["data_file"]).await?;
    let data = form.take_file("data_file")?;
    let metadata = form.take_text("metadata_file")?;

    debug!(
        "single-file upload '{}' ({} bytes)",
        data.filename,
        data.body.size_bytes()
    );
    let response = service.upload_file(data, &metadata).await?;
    Ok(Json(response))
}

/// `POST /upload_folder/` with `zip_file`, `metadata_file` and optional `name`.
pub async fn upload_folder(
    State(service): State<DataLakeService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<FolderUploadResponse>, AppError> {
    let mut form = read_form(multipart?, service.spool_dir(), &["zip_file"]).await?;
    let archive = form.take_file("zip_file")?;
    let metadata = form.take_text("metadata_file")?;
    let name = form
        .texts
        .remove("name")
        .map(|raw| String::from_utf8_lossy(&raw).trim().to_string());

    debug!(
        "folder upload '{}' ({} bytes)",
        archive.filename,
        archive.body.size_bytes()
    );
    let response = service.upload_folder(archive, &metadata, name).await?;
    Ok(Json(response))
}

/// Form fields by name. Later duplicates replace earlier ones.
#[derive(Default)]
struct UploadForm {
    files: HashMap<String, UploadedPart>,
    texts: HashMap<String, Bytes>,
}

impl UploadForm {
    fn take_file(&mut self, name: &str) -> Result<UploadedPart, AppError> {
        self.files.remove(name).ok_or_else(|| missing(name))
    }

    fn take_text(&mut self, name: &str) -> Result<Bytes, AppError> {
        self.texts.remove(name).ok_or_else(|| missing(name))
    }
}

fn missing(name: &str) -> AppError {
    AppError::bad_request(format!("Missing form field '{}'.", name))
}

/// Drain the multipart body. Fields named in `file_fields` go to the spool,
/// everything else is buffered up to [`MAX_TEXT_FIELD_BYTES`].
async fn read_form(
    mut multipart: Multipart,
    spool_dir: &Path,
    file_fields: &[&str],
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("failed to read multipart field: {}", e);
        AppError::from(e)
    })? {
        let name = field.name().unwrap_or("").to_string();
        if file_fields.contains(&name.as_str()) {
            let filename = field.file_name().unwrap_or("").to_string();
            let content_type = field.content_type().map(|s| s.to_string());
            let body = spool_field(field, spool_dir).await?;
            form.files.insert(
                name,
                UploadedPart {
                    filename,
                    content_type,
                    body,
                },
            );
        } else {
            let data = buffer_field(field, &name).await?;
            form.texts.insert(name, data);
        }
    }

    Ok(form)
}

async fn spool_field(mut field: Field<'_>, spool_dir: &Path) -> Result<SpooledFile, AppError> {
    let mut writer = SpoolWriter::create(spool_dir).map_err(spool_error)?;
    while let Some(chunk) = field.chunk().await? {
        writer.write(&chunk).await.map_err(spool_error)?;
    }
    writer.finish().await.map_err(spool_error)
}

async fn buffer_field(mut field: Field<'_>, name: &str) -> Result<Bytes, AppError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Form field '{}' exceeds {} bytes.", name, MAX_TEXT_FIELD_BYTES),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn spool_error(err: SpoolError) -> AppError {
    warn!("failed to spool upload: {}", err);
    AppError::internal(format!("Could not buffer upload: {}", err))
}
