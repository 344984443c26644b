pub mod db_pool;
pub mod executor;
pub mod introspect;
pub mod schema_manager;

use r2d2::Pool;
use thiserror::Error;
use tracing::info;

use crate::config::{DatabaseConfig, SafetyMode};
use crate::db::db_pool::DuckDBConnectionManager;
use crate::util::redact::redact;

pub type DbPool = Pool<DuckDBConnectionManager>;

#[derive(Debug, Error)]
pub enum DbError {
    /// The database could not be reached or no pooled connection was free in time
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Metadata queries failed or returned inconsistent results
    #[error("Schema error: {0}")]
    Schema(String),
}

impl From<r2d2::Error> for DbError {
    fn from(err: r2d2::Error) -> Self {
        DbError::Connection(redact(&err.to_string()))
    }
}

/// Opens the database and builds the bounded connection pool.
pub fn build_pool(config: &DatabaseConfig, mode: SafetyMode) -> Result<DbPool, DbError> {
    info!(
        "Initializing DuckDB connection pool ({} connections) for {}",
        config.pool_size,
        redact(&config.connection_string)
    );

    let manager = DuckDBConnectionManager::new(config, mode == SafetyMode::ReadOnly)
        .map_err(|e| DbError::Connection(redact(&e.to_string())))?;

    let pool = Pool::builder()
        .max_size(config.pool_size as u32)
        .connection_timeout(config.pool_timeout())
        .build(manager)?;

    Ok(pool)
}
