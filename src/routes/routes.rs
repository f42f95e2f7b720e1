//! Defines routes for the data lake API.
//!
//! ## Structure
//! - **Operational endpoints**
//!   - `GET  /status`, `GET /healthz`, `GET /readyz`
//!
//! - **Uploads**
//!   - `POST /uploadfile/`: single file + YAML metadata
//!   - `POST /upload_folder/`: zip archive + YAML metadata (+ optional name)
//!
//! - **Search**
//!   - `GET  /search`: folders
//!   - `GET  /search_files`: files
//!
//! - **Downloads**
//!   - `GET  /download/{file_id}`: raw object bytes
//!   - `GET  /folders/{folder_id}/files`: folder listing
//!   - `GET  /folders/{folder_id}/download_zip`: streamed zip export

use crate::{
    handlers::{
        download_handlers::{download_file, download_zip, folder_files},
        health_handlers::{healthz, readyz, status},
        search_handlers::{search_files, search_folders},
        upload_handlers::{upload_file, upload_folder},
    },
    services::lake_service::DataLakeService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router for every data lake endpoint.
///
/// The router carries shared state (`DataLakeService`) to all handlers.
pub fn routes() -> Router<DataLakeService> {
    Router::new()
        // health endpoints
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // uploads
        .route("/uploadfile/", post(upload_file))
        .route("/upload_folder/", post(upload_folder))
        // search
        .route("/search", get(search_folders))
        .route("/search_files", get(search_files))
        // downloads
        .route("/download/{file_id}", get(download_file))
        .route("/folders/{folder_id}/files", get(folder_files))
        .route("/folders/{folder_id}/download_zip", get(download_zip))
}
