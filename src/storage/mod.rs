pub mod memory;
pub mod merge;
pub mod sqlite;
pub mod trait_def;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;
pub use trait_def::{RollupRepository, StorageError, StorageResult, DEFAULT_QUERY_LIMIT};

use std::sync::Arc;
use tracing::info;

use crate::config::{DatabaseBackend, DatabaseConfig};

/// Open and initialize the repository selected by the configuration
pub async fn open_repository(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn RollupRepository>> {
    let repository: Arc<dyn RollupRepository> = match config.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite repository: {}", config.url);
            Arc::new(SqliteRepository::new(&config.url, config.max_connections).await?)
        }
        DatabaseBackend::Memory => {
            info!("Using in-memory repository, rollups will not survive a restart");
            Arc::new(MemoryRepository::new())
        }
    };

    repository.init().await?;
    Ok(repository)
}
