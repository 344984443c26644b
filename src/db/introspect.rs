use duckdb::Connection;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::db::{DbError, DbPool};

static FOREIGN_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)FOREIGN\s+KEY\s*\(([^)]*)\)\s*REFERENCES\s+([\w."]+)\s*\(([^)]*)\)"#)
        .expect("foreign key pattern is valid")
});

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "pg_catalog"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum KeyRole {
    None,
    Primary,
    Unique,
    Foreign { table: String, column: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub key: KeyRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Name as it should be written in a query; tables outside `main` are qualified.
    pub fn qualified_name(&self) -> String {
        if self.schema == "main" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// Tables and columns the model may use, in catalog order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaDescription {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(TableDescriptor::qualified_name).collect()
    }

    /// Text form handed to the model.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for table in &self.tables {
            let label = match table.kind {
                TableKind::Table => "TABLE",
                TableKind::View => "VIEW",
            };
            let _ = writeln!(out, "=== {}: {} ===", label, table.qualified_name());
            out.push_str("COLUMNS:\n");

            let mut relationships = Vec::new();
            for column in &table.columns {
                let key = match &column.key {
                    KeyRole::Primary => " PK",
                    KeyRole::Unique => " UNIQUE",
                    KeyRole::Foreign { table: target, column: target_column } => {
                        relationships.push(format!("  {} -> {}.{}", column.name, target, target_column));
                        " FK"
                    }
                    KeyRole::None => "",
                };
                let null = if column.nullable { "" } else { " NOT NULL" };
                let _ = writeln!(out, "  {}: {}{}{}", column.name, column.data_type, key, null);
            }

            if !relationships.is_empty() {
                out.push_str("RELATIONSHIPS:\n");
                for line in relationships {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out.push('\n');
        }

        out.trim_end().to_string()
    }
}

/// Reads table and column metadata from the pooled database.
pub struct SchemaIntrospector {
    pool: DbPool,
    include_views: bool,
}

impl SchemaIntrospector {
    pub fn new(pool: DbPool, include_views: bool) -> Self {
        Self { pool, include_views }
    }

    pub async fn describe_schema(&self) -> Result<SchemaDescription, DbError> {
        let pool = self.pool.clone();
        let include_views = self.include_views;

        // DuckDB calls block, keep them off the async workers
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            describe_connection(&conn, include_views)
        })
        .await
        .map_err(|e| DbError::Schema(format!("Schema introspection task failed: {}", e)))?
    }
}

/// Builds a [`SchemaDescription`] from one connection.
///
/// A table that vanishes between listing and column lookup is skipped with a warning.
pub fn describe_connection(conn: &Connection, include_views: bool) -> Result<SchemaDescription, DbError> {
    let listed = list_tables(conn)?;
    debug!("Listed {} relations", listed.len());

    let mut tables = Vec::new();
    for (schema, name, kind) in listed {
        if kind == TableKind::View && !include_views {
            continue;
        }

        let columns = match list_columns(conn, &schema, &name) {
            Ok(columns) if !columns.is_empty() => columns,
            Ok(_) => {
                warn!("Table {}.{} has no columns any more, skipping it", schema, name);
                continue;
            }
            Err(e) => {
                warn!("Could not read columns of {}.{}: {}", schema, name, e);
                continue;
            }
        };

        let keys = match list_keys(conn, &schema, &name) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Could not read constraints of {}.{}: {}", schema, name, e);
                HashMap::new()
            }
        };

        let columns = columns
            .into_iter()
            .map(|(column, data_type, nullable)| ColumnDescriptor {
                key: keys.get(&column).cloned().unwrap_or(KeyRole::None),
                name: column,
                data_type,
                nullable,
            })
            .collect();

        tables.push(TableDescriptor {
            schema,
            name,
            kind,
            columns,
        });
    }

    info!("Introspected {} tables", tables.len());
    Ok(SchemaDescription { tables })
}

fn list_tables(conn: &Connection) -> Result<Vec<(String, String, TableKind)>, DbError> {
    let query = "
        SELECT table_schema, table_name, table_type
        FROM information_schema.tables
        WHERE table_catalog = current_database()
        ORDER BY table_schema, table_name
    ";

    let mut stmt = conn
        .prepare(query)
        .map_err(|e| DbError::Schema(format!("Failed to list tables: {}", e)))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?, // table_schema
                row.get::<_, String>(1)?, // table_name
                row.get::<_, String>(2)?, // table_type
            ))
        })
        .map_err(|e| DbError::Schema(format!("Failed to list tables: {}", e)))?;

    let mut tables = Vec::new();
    for row in rows {
        let (schema, name, table_type) =
            row.map_err(|e| DbError::Schema(format!("Failed to read table listing: {}", e)))?;

        if SYSTEM_SCHEMAS.contains(&schema.as_str()) {
            continue;
        }
        let kind = match table_type.as_str() {
            "BASE TABLE" => TableKind::Table,
            "VIEW" => TableKind::View,
            _ => continue,
        };
        tables.push((schema, name, kind));
    }

    Ok(tables)
}

fn list_columns(conn: &Connection, schema: &str, table: &str) -> Result<Vec<(String, String, bool)>, duckdb::Error> {
    let query = "
        SELECT column_name, data_type, is_nullable
        FROM information_schema.columns
        WHERE table_catalog = current_database() AND table_schema = ? AND table_name = ?
        ORDER BY ordinal_position
    ";

    let mut stmt = conn.prepare(query)?;
    let columns = stmt
        .query_map([schema, table], |row| {
            Ok((
                row.get::<_, String>(0)?, // column_name
                row.get::<_, String>(1)?, // data_type
                row.get::<_, String>(2)? == "YES", // is_nullable
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(columns)
}

fn list_keys(conn: &Connection, schema: &str, table: &str) -> Result<HashMap<String, KeyRole>, duckdb::Error> {
    let query = "
        SELECT constraint_type, constraint_text, unnest(constraint_column_names) AS column_name
        FROM duckdb_constraints()
        WHERE database_name = current_database() AND schema_name = ? AND table_name = ?
          AND constraint_type IN ('PRIMARY KEY', 'UNIQUE', 'FOREIGN KEY')
    ";

    let mut stmt = conn.prepare(query)?;
    let rows = stmt
        .query_map([schema, table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut keys: HashMap<String, KeyRole> = HashMap::new();
    for (constraint_type, constraint_text, column) in rows {
        let role = match constraint_type.as_str() {
            "PRIMARY KEY" => KeyRole::Primary,
            "UNIQUE" => KeyRole::Unique,
            _ => match foreign_target(&constraint_text, &column) {
                Some((table, column)) => KeyRole::Foreign { table, column },
                None => continue,
            },
        };

        // a primary key outranks anything else on the same column
        let entry = keys.entry(column).or_insert(KeyRole::None);
        if *entry != KeyRole::Primary && !(matches!(entry, KeyRole::Foreign { .. }) && role == KeyRole::Unique) {
            *entry = role;
        }
    }

    Ok(keys)
}

/// Referenced table and column for `column` in a `FOREIGN KEY (...) REFERENCES t(...)` clause.
fn foreign_target(constraint_text: &str, column: &str) -> Option<(String, String)> {
    let caps = FOREIGN_KEY.captures(constraint_text)?;
    let clean = |s: &str| s.trim().trim_matches('"').to_string();

    let local: Vec<String> = caps[1].split(',').map(clean).collect();
    let remote: Vec<String> = caps[3].split(',').map(clean).collect();
    let position = local.iter().position(|c| c.eq_ignore_ascii_case(column))?;

    Some((clean(&caps[2]), remote.get(position)?.clone()))
}
