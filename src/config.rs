use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr};

use crate::services::lake_service::LakeSettings;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub max_upload_bytes: usize,
    pub max_unpacked_bytes: u64,
    pub spool_dir: PathBuf,
    pub key_attempts: u32,
    pub storage_retries: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Research data lake API")]
pub struct Args {
    /// Host to bind to (overrides DATALAKE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DATALAKE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides DATALAKE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DATALAKE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket that receives uploads (overrides DATALAKE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum request body size in bytes (overrides DATALAKE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Total decompressed size allowed per folder archive (overrides DATALAKE_MAX_UNPACKED_BYTES)
    #[arg(long)]
    pub max_unpacked_bytes: Option<u64>,

    /// Scratch directory for uploads in flight (overrides DATALAKE_SPOOL_DIR,
    /// defaults to `<storage_dir>/.spool`)
    #[arg(long)]
    pub spool_dir: Option<String>,

    /// Conflicting-write retries per upload (overrides DATALAKE_KEY_ATTEMPTS)
    #[arg(long)]
    pub key_attempts: Option<u32>,

    /// Retries for object existence checks (overrides DATALAKE_STORAGE_RETRIES)
    #[arg(long)]
    pub storage_retries: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let env_host = env::var("DATALAKE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DATALAKE_PORT", 8001u16)?;
        let env_storage =
            env::var("DATALAKE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("DATALAKE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/datalake.db".into());
        let env_bucket = env::var("DATALAKE_BUCKET").unwrap_or_else(|_| "raw-data".into());
        let env_max_upload = env_parse("DATALAKE_MAX_UPLOAD_BYTES", 1024 * 1024 * 1024usize)?;
        let env_max_unpacked =
            env_parse("DATALAKE_MAX_UNPACKED_BYTES", 16 * 1024 * 1024 * 1024u64)?;
        let env_spool = env::var("DATALAKE_SPOOL_DIR").ok();
        let env_key_attempts = env_parse("DATALAKE_KEY_ATTEMPTS", 5u32)?;
        let env_storage_retries = env_parse("DATALAKE_STORAGE_RETRIES", 3u32)?;

        let storage_dir = args.storage_dir.unwrap_or(env_storage);
        let spool_dir = args
            .spool_dir
            .or(env_spool)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&storage_dir).join(".spool"));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir,
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            max_unpacked_bytes: args.max_unpacked_bytes.unwrap_or(env_max_unpacked),
            spool_dir,
            key_attempts: args.key_attempts.unwrap_or(env_key_attempts),
            storage_retries: args.storage_retries.unwrap_or(env_storage_retries),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The subset of configuration the upload/search service needs.
    pub fn lake_settings(&self) -> LakeSettings {
        LakeSettings {
            bucket: self.bucket.clone(),
            key_attempts: self.key_attempts.max(1),
            storage_retries: self.storage_retries,
            spool_dir: self.spool_dir.clone(),
            max_unpacked_bytes: self.max_unpacked_bytes,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
