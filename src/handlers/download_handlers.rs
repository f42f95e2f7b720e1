//! Download handlers. Object bodies and zip exports are streamed, never
//! buffered in memory.

use crate::{
    errors::AppError,
    models::file_record::FileRecord,
    services::lake_service::DataLakeService,
};
use axum::{
    Json,
    body::Body,
    extract::{
        Path, Query, State,
        rejection::{PathRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ZipQuery {
    pub subpath: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FolderFilesResponse {
    pub folder_id: Uuid,
    pub files: Vec<FileRecord>,
}

/// `GET /download/{file_id}`: stream the stored bytes under the original filename.
pub async fn download_file(
    State(service): State<DataLakeService>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Response, AppError> {
    let Path(file_id) = path?;
    let download = service.download(&file_id).await?;
    let body = Body::from_stream(ReaderStream::new(download.reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &download.record);
    Ok(response)
}

/// `GET /folders/{folder_id}/files`
pub async fn folder_files(
    State(service): State<DataLakeService>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<FolderFilesResponse>, AppError> {
    let Path(folder_id) = path?;
    let folder_id = parse_folder_id(&folder_id)?;
    let files = service.folder_files(folder_id).await?;
    Ok(Json(FolderFilesResponse { folder_id, files }))
}

/// `GET /folders/{folder_id}/download_zip?subpath=...`
pub async fn download_zip(
    State(service): State<DataLakeService>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<ZipQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let (Path(folder_id), Query(q)) = (path?, query?);
    let folder_id = parse_folder_id(&folder_id)?;
    let (filename, stream) = service.export_zip(folder_id, q.subpath.as_deref()).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    insert_disposition(headers, &filename);
    Ok(response)
}

/// Unparseable ids cannot name a folder, so they are reported the same way
/// as unknown ones.
fn parse_folder_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::not_found("Folder not found."))
}

fn set_file_headers(headers: &mut HeaderMap, record: &FileRecord) {
    let content_type = record
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    let length = record.size_bytes.max(0);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if let Some(etag) = record.checksum_etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    insert_disposition(headers, &record.original_filename);
}

fn insert_disposition(headers: &mut HeaderMap, filename: &str) {
    let cleaned: String = filename
        .chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect();
    let value = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", cleaned))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);
}
