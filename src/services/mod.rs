pub mod archive;
pub mod error;
pub mod folder_service;
pub mod index_writer;
pub mod key_allocator;
pub mod lake_service;
pub mod metadata;
pub mod naming;
pub mod object_store;
pub mod search;
pub mod spool;
pub mod zip_ingest;
