//! Core data models for the data lake index.
//!
//! Two tables back these entities: `folders` and `file_index`. They map to
//! rows via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file_record;
pub mod folder;
