use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

/// Hands out connections to one shared DuckDB instance.
///
/// The database is opened once; every pooled connection is a clone of that
/// handle, so in-memory databases are shared across the pool too.
pub struct DuckDBConnectionManager {
    base: Mutex<Connection>,
    default_catalog: Option<String>,
}

impl DuckDBConnectionManager {
    pub fn new(config: &DatabaseConfig, read_only: bool) -> Result<Self, duckdb::Error> {
        let base = if config.connection_string == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.connection_string)?
        };

        if let Some(attach) = &config.attach {
            info!("Attaching external {:?} database as '{}'", attach.kind, attach.alias);
            base.execute_batch(&attach.to_attach_sql(read_only))?;
        }

        Ok(Self {
            base: Mutex::new(base),
            default_catalog: config.attach.as_ref().map(|a| a.alias.clone()),
        })
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = {
            let base = self.base.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            base.try_clone()?
        };

        if let Some(catalog) = &self.default_catalog {
            conn.execute_batch(&format!("USE \"{}\"", catalog))?;
        }

        debug!("Opened pooled DuckDB connection");
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use r2d2::Pool;

    #[test]
    fn test_pooled_connections_share_in_memory_database() {
        let mut config = AppConfig::default().database;
        config.connection_string = ":memory:".to_string();

        let manager = DuckDBConnectionManager::new(&config, true).unwrap();
        let pool = Pool::builder().max_size(2).build(manager).unwrap();

        let first = pool.get().unwrap();
        first.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2);").unwrap();

        let second = pool.get().unwrap();
        let count: i64 = second.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 2);
    }
}
