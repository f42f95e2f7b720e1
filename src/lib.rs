//! Research data lake: uploads of files and zipped folders with YAML
//! metadata, a searchable SQLite index and streaming downloads.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
