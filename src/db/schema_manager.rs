use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::introspect::{SchemaDescription, SchemaIntrospector};
use crate::db::DbError;

/// A struct to cache and manage database schema information
///
/// Shared by every session. Populated on first use and read-only afterwards
/// until [`SchemaManager::invalidate`] or [`SchemaManager::refresh_cache`].
pub struct SchemaManager {
    introspector: SchemaIntrospector,
    /// Cached schema, `None` until first use or after invalidation
    schema_cache: RwLock<Option<Arc<SchemaDescription>>>,
    /// Last refresh timestamp
    last_refresh: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl SchemaManager {
    pub fn new(introspector: SchemaIntrospector) -> Self {
        Self {
            introspector,
            schema_cache: RwLock::new(None),
            last_refresh: RwLock::new(None),
        }
    }

    /// Returns the cached schema, introspecting the database on a miss.
    pub async fn schema(&self) -> Result<Arc<SchemaDescription>, DbError> {
        if let Some(schema) = self.schema_cache.read().await.as_ref() {
            return Ok(Arc::clone(schema));
        }

        let mut cache = self.schema_cache.write().await;
        // another session may have filled it while we waited for the lock
        if let Some(schema) = cache.as_ref() {
            return Ok(Arc::clone(schema));
        }

        debug!("Schema cache miss, introspecting database");
        let schema = Arc::new(self.introspector.describe_schema().await?);
        *cache = Some(Arc::clone(&schema));
        *self.last_refresh.write().await = Some(chrono::Utc::now());

        Ok(schema)
    }

    /// Refresh the schema cache
    pub async fn refresh_cache(&self) -> Result<Arc<SchemaDescription>, DbError> {
        info!("Refreshing schema cache");
        self.invalidate().await;
        self.schema().await
    }

    /// Drops the cached schema; the next turn introspects again.
    pub async fn invalidate(&self) {
        *self.schema_cache.write().await = None;
        info!("Schema cache invalidated");
    }

    pub async fn last_refresh(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.last_refresh.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, SafetyMode};
    use crate::db::{build_pool, DbPool};

    fn memory_pool() -> DbPool {
        let mut config = AppConfig::default().database;
        config.connection_string = ":memory:".to_string();
        build_pool(&config, SafetyMode::ReadWrite).unwrap()
    }

    #[tokio::test]
    async fn test_schema_is_cached_until_invalidated() {
        let pool = memory_pool();
        pool.get().unwrap().execute_batch("CREATE TABLE a (id INTEGER);").unwrap();

        let manager = SchemaManager::new(SchemaIntrospector::new(pool.clone(), true));
        assert!(manager.last_refresh().await.is_none());

        let first = manager.schema().await.unwrap();
        assert_eq!(first.table_names(), vec!["a"]);
        assert!(manager.last_refresh().await.is_some());

        pool.get().unwrap().execute_batch("CREATE TABLE b (id INTEGER);").unwrap();
        let cached = manager.schema().await.unwrap();
        assert_eq!(cached.table_names(), vec!["a"]);

        manager.invalidate().await;
        let fresh = manager.schema().await.unwrap();
        assert_eq!(fresh.table_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_refresh_cache_reintrospects() {
        let pool = memory_pool();
        let manager = SchemaManager::new(SchemaIntrospector::new(pool.clone(), true));
        assert!(manager.schema().await.unwrap().is_empty());

        pool.get().unwrap().execute_batch("CREATE TABLE c (id INTEGER);").unwrap();
        let refreshed = manager.refresh_cache().await.unwrap();
        assert_eq!(refreshed.table_names(), vec!["c"]);
    }
}
