//! Filtered, paginated search over folders and files.
//!
//! Both searches run against a single table (files carry a copy of their
//! folder's metadata). Text filters are case-insensitive substring matches
//! against the pre-folded `*_lc` columns, tag filters match anywhere in the
//! folded JSON tag list, and date filters are
//! inclusive bounds on `date_conducted`. Results are newest first with `id`
//! breaking ties, so pages are stable.

use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    error::{LakeResult, ValidationError},
    metadata::parse_iso_date,
    naming::{fold_case, json_escaped},
};
use crate::models::{
    file_record::{FILE_COLUMNS, FileRecord},
    folder::{FOLDER_COLUMNS, Folder},
};

pub const DEFAULT_FOLDER_LIMIT: i64 = 50;
pub const DEFAULT_FILE_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 500;

/// Filters accepted by folder search (`GET /search`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderSearchParams {
    pub project: Option<String>,
    pub author: Option<String>,
    pub experiment_type: Option<String>,
    pub tags_contain: Option<String>,
    pub date_after: Option<String>,
    pub date_before: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters accepted by file search (`GET /search_files`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSearchParams {
    pub file_id: Option<String>,
    #[serde(alias = "research_project_id")]
    pub project: Option<String>,
    pub author: Option<String>,
    pub file_type: Option<String>,
    pub experiment_type: Option<String>,
    pub tags_contain: Option<String>,
    pub date_after: Option<String>,
    pub date_before: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Effective page after defaults and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    fn resolve(limit: Option<i64>, offset: Option<i64>, default_limit: i64) -> Self {
        Self {
            limit: limit.unwrap_or(default_limit).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

/// Parsed, validated predicates shared by both searches.
#[derive(Debug, Default)]
struct Filters {
    exact_file_id: Option<Uuid>,
    contains: Vec<(&'static str, String)>,
    tags_contain: Option<String>,
    date_after: Option<NaiveDate>,
    date_before: Option<NaiveDate>,
}

impl Filters {
    fn substring(&mut self, column: &'static str, value: Option<&String>) {
        if let Some(value) = non_blank(value) {
            self.contains.push((column, value));
        }
    }

    fn dates(
        &mut self,
        after: Option<&String>,
        before: Option<&String>,
        issues: &mut Vec<String>,
    ) {
        if let Some(raw) = non_blank(after) {
            match parse_iso_date("date_after", &raw) {
                Ok(date) => self.date_after = Some(date),
                Err(issue) => issues.push(issue),
            }
        }
        if let Some(raw) = non_blank(before) {
            match parse_iso_date("date_before", &raw) {
                Ok(date) => self.date_before = Some(date),
                Err(issue) => issues.push(issue),
            }
        }
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE 1 = 1");
        if let Some(file_id) = self.exact_file_id {
            builder.push(" AND file_id = ").push_bind(file_id);
        }
        for (column, value) in &self.contains {
            builder
                .push(format!(" AND {}_lc LIKE ", column))
                .push_bind(like_pattern(value))
                .push(" ESCAPE '\\'");
        }
        // Tags are stored as JSON text, so `"` and `\` in the needle must be
        // escaped the same way to match.
        if let Some(tag) = &self.tags_contain {
            builder
                .push(" AND tags_lc LIKE ")
                .push_bind(like_pattern(&json_escaped(tag)))
                .push(" ESCAPE '\\'");
        }
        if let Some(after) = self.date_after {
            builder.push(" AND date_conducted >= ").push_bind(after);
        }
        if let Some(before) = self.date_before {
            builder.push(" AND date_conducted <= ").push_bind(before);
        }
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    db: Arc<SqlitePool>,
}

impl SearchEngine {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn search_folders(&self, params: &FolderSearchParams) -> LakeResult<(Vec<Folder>, Page)> {
        let mut issues = Vec::new();
        let mut filters = Filters::default();
        filters.substring("project", params.project.as_ref());
        filters.substring("author", params.author.as_ref());
        filters.substring("experiment_type", params.experiment_type.as_ref());
        filters.tags_contain = non_blank(params.tags_contain.as_ref());
        filters.dates(params.date_after.as_ref(), params.date_before.as_ref(), &mut issues);
        if !issues.is_empty() {
            return Err(ValidationError::from_issues(issues).into());
        }
        let page = Page::resolve(params.limit, params.offset, DEFAULT_FOLDER_LIMIT);

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM folders", FOLDER_COLUMNS));
        filters.push_where(&mut builder);
        push_page(&mut builder, "id", page);
        debug!("folder search: {}", builder.sql());

        let rows = builder.build_query_as::<Folder>().fetch_all(&*self.db).await?;
        Ok((rows, page))
    }

    pub async fn search_files(&self, params: &FileSearchParams) -> LakeResult<(Vec<FileRecord>, Page)> {
        let mut issues = Vec::new();
        let mut filters = Filters::default();
        if let Some(raw) = non_blank(params.file_id.as_ref()) {
            match Uuid::parse_str(&raw) {
                Ok(id) => filters.exact_file_id = Some(id),
                Err(_) => issues.push(format!("'file_id' must be a UUID, got '{}'", raw)),
            }
        }
        filters.substring("project", params.project.as_ref());
        filters.substring("author", params.author.as_ref());
        filters.substring("extension", params.file_type.as_ref());
        filters.substring("experiment_type", params.experiment_type.as_ref());
        filters.tags_contain = non_blank(params.tags_contain.as_ref());
        filters.dates(params.date_after.as_ref(), params.date_before.as_ref(), &mut issues);
        if !issues.is_empty() {
            return Err(ValidationError::from_issues(issues).into());
        }
        let page = Page::resolve(params.limit, params.offset, DEFAULT_FILE_LIMIT);

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM file_index", FILE_COLUMNS));
        filters.push_where(&mut builder);
        push_page(&mut builder, "file_id", page);
        debug!("file search: {}", builder.sql());

        let rows = builder.build_query_as::<FileRecord>().fetch_all(&*self.db).await?;
        Ok((rows, page))
    }

    /// Look up a single indexed file.
    pub async fn get_file(&self, file_id: Uuid) -> LakeResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_index WHERE file_id = ?",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

fn push_page(builder: &mut QueryBuilder<'_, Sqlite>, id_column: &str, page: Page) {
    builder
        .push(format!(" ORDER BY created_at DESC, {} DESC LIMIT ", id_column))
        .push_bind(page.limit)
        .push(" OFFSET ")
        .push_bind(page.offset);
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `%value%` with LIKE metacharacters escaped, case-folded.
fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for c in fold_case(value).chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
