pub mod app_config;
pub mod memory;
pub mod redis_repo;

use std::sync::Arc;

use rideshare_core::{PersistenceError, RecordStore};

pub use memory::MemoryRecordStore;
pub use redis_repo::RedisRecordStore;

use app_config::{StorageBackend, StorageConfig};

/// Builds the record store selected by configuration.
pub async fn connect(config: &StorageConfig, feed_capacity: usize) -> Result<Arc<dyn RecordStore>, PersistenceError> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory record store");
            Ok(Arc::new(MemoryRecordStore::with_capacity(feed_capacity)))
        }
        StorageBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                PersistenceError::Unavailable("storage.redis_url is required for the redis backend".to_string())
            })?;
            let store = RedisRecordStore::new(url, config.key_prefix.as_deref(), feed_capacity).await?;
            tracing::info!("Using redis record store");
            Ok(Arc::new(store))
        }
    }
}
