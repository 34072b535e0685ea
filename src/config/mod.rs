use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub flush: FlushConfig,
    pub raw_export: RawExportConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Seconds between background rollup flushes
    pub interval_secs: u64,
    /// Raw buffer size (estimated bytes) that triggers a raw export
    pub max_raw_bytes: usize,
    /// Extra attempts made by the shutdown retry path
    pub max_retries: u32,
    /// Base delay of the exponential backoff, in milliseconds
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExportConfig {
    /// Directory receiving JSON-lines batches
    /// If None, raw events are dropped after each export cycle
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: u32,
}

impl FlushConfig {
    const DEFAULT_INTERVAL_SECS: u64 = 10;
    const DEFAULT_MAX_RAW_BYTES: usize = 16 * 1024 * 1024;
    const DEFAULT_MAX_RETRIES: u32 = 3;
    const DEFAULT_RETRY_DELAY_MS: u64 = 500;

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl RetentionConfig {
    const DEFAULT_DAYS: u32 = 90;
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_vars<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_str = lookup("TALLY_DATABASE_BACKEND").unwrap_or_else(|| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "sqlite" => DatabaseBackend::Sqlite,
            "memory" => DatabaseBackend::Memory,
            other => {
                tracing::warn!(
                    "Unknown TALLY_DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, memory"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url = lookup("TALLY_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./tally.db?mode=rwc".to_string());

        let max_connections = parse_or(&lookup, "TALLY_DATABASE_MAX_CONNECTIONS", 5u32)?;

        let flush = FlushConfig {
            interval_secs: parse_or(
                &lookup,
                "TALLY_FLUSH_INTERVAL_SECS",
                FlushConfig::DEFAULT_INTERVAL_SECS,
            )?,
            max_raw_bytes: parse_or(
                &lookup,
                "TALLY_MAX_RAW_BYTES",
                FlushConfig::DEFAULT_MAX_RAW_BYTES,
            )?,
            max_retries: parse_or(
                &lookup,
                "TALLY_FLUSH_MAX_RETRIES",
                FlushConfig::DEFAULT_MAX_RETRIES,
            )?,
            retry_delay_ms: parse_or(
                &lookup,
                "TALLY_FLUSH_RETRY_DELAY_MS",
                FlushConfig::DEFAULT_RETRY_DELAY_MS,
            )?,
        };

        let raw_export_dir = lookup("TALLY_RAW_EXPORT_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let retention_days = parse_or(&lookup, "TALLY_RETENTION_DAYS", RetentionConfig::DEFAULT_DAYS)?;

        let config = Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            flush,
            raw_export: RawExportConfig {
                dir: raw_export_dir,
            },
            retention: RetentionConfig {
                days: retention_days,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            bail!("TALLY_DATABASE_MAX_CONNECTIONS must be at least 1");
        }
        if self.flush.interval_secs == 0 {
            bail!("TALLY_FLUSH_INTERVAL_SECS must be at least 1");
        }
        if self.flush.max_raw_bytes == 0 {
            bail!("TALLY_MAX_RAW_BYTES must be at least 1");
        }
        if self.retention.days == 0 {
            bail!("TALLY_RETENTION_DAYS must be at least 1");
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{value}'")),
        None => Ok(default),
    }
}
