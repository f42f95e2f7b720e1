//! Folder and file search handlers.

use crate::{
    errors::AppError,
    models::{file_record::FileRecord, folder::Folder},
    services::{
        lake_service::DataLakeService,
        search::{FileSearchParams, FolderSearchParams, Page},
    },
};
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
};
use serde::Serialize;

/// Envelope shared by both search endpoints.
#[derive(Debug, Serialize)]
pub struct SearchResponse<T> {
    pub results: Vec<T>,
    pub limit: i64,
    pub offset: i64,
    /// Number of results on this page.
    pub count: usize,
}

impl<T> SearchResponse<T> {
    fn new(results: Vec<T>, page: Page) -> Self {
        Self {
            count: results.len(),
            results,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

/// `GET /search`: folders, newest first.
pub async fn search_folders(
    State(service): State<DataLakeService>,
    query: Result<Query<FolderSearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse<Folder>>, AppError> {
    let Query(params) = query?;
    let (results, page) = service.search.search_folders(&params).await?;
    Ok(Json(SearchResponse::new(results, page)))
}

/// `GET /search_files`: files, newest first.
pub async fn search_files(
    State(service): State<DataLakeService>,
    query: Result<Query<FileSearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse<FileRecord>>, AppError> {
    let Query(params) = query?;
    let (results, page) = service.search.search_files(&params).await?;
    Ok(Json(SearchResponse::new(results, page)))
}
