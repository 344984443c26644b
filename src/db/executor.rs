use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type, UInt32Type,
    UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use duckdb::Connection;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{SafetyConfig, SafetyMode};
use crate::db::DbPool;
use crate::sql::{classify, split_statements, StatementKind};
use crate::util::redact::redact;

/// Which statements may run and how much of a result is kept.
#[derive(Debug, Clone, Copy)]
pub struct SafetyPolicy {
    pub mode: SafetyMode,
    pub max_rows: usize,
    pub max_payload_bytes: usize,
}

impl From<&SafetyConfig> for SafetyPolicy {
    fn from(config: &SafetyConfig) -> Self {
        Self {
            mode: config.mode,
            max_rows: config.max_rows,
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    fn payload_len(&self) -> usize {
        match self {
            CellValue::Null => 4,
            CellValue::Bool(_) => 5,
            CellValue::Int(_) | CellValue::Float(_) => 8,
            CellValue::Text(text) => text.len(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "NULL"),
            CellValue::Bool(value) => write!(f, "{}", value),
            CellValue::Int(value) => write!(f, "{}", value),
            CellValue::Float(value) => write!(f, "{}", value),
            CellValue::Text(value) => write!(f, "{}", value),
        }
    }
}

/// Rows produced by a statement, possibly cut short by the policy caps.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Rows the statement produced, including those not kept
    pub total_rows: usize,
    pub truncated: bool,
    pub statement: StatementKind,
    /// Set for writes that were rolled back and wait for an explicit confirmation
    pub requires_confirmation: bool,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    PolicyViolation,
    Execution,
    Timeout,
    Connection,
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub failed_sql: String,
}

impl QueryError {
    fn new(kind: QueryErrorKind, message: impl Into<String>, sql: &str) -> Self {
        Self {
            kind,
            message: redact(&message.into()),
            failed_sql: sql.to_string(),
        }
    }
}

/// Runs statements under the safety policy.
///
/// DML and DDL execute inside their own transaction, committed for SELECTs
/// and for writes the user confirmed and rolled back otherwise. Other
/// statements only run once confirmed, outside a transaction.
pub struct QueryExecutor {
    pool: DbPool,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// First phase: SELECTs run, writes are rolled back and flagged for confirmation.
    pub async fn execute(&self, sql: &str, policy: &SafetyPolicy) -> Result<QueryResult, QueryError> {
        self.run(sql, policy, false).await
    }

    /// Second phase: applies a write the user has explicitly confirmed.
    pub async fn execute_confirmed(&self, sql: &str, policy: &SafetyPolicy) -> Result<QueryResult, QueryError> {
        self.run(sql, policy, true).await
    }

    async fn run(&self, sql: &str, policy: &SafetyPolicy, confirmed: bool) -> Result<QueryResult, QueryError> {
        let kind = check_policy(sql, policy)?;
        let commit = kind.is_read_only() || confirmed;

        // statements outside DML/DDL are not transactional, so they are never dry-run
        if kind == StatementKind::Other && !confirmed {
            info!("{} statement cannot be previewed, waiting for confirmation: {}", kind.label(), sql);
            return Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                total_rows: 0,
                truncated: false,
                statement: kind,
                requires_confirmation: true,
                execution_time_ms: 0,
            });
        }

        info!(
            "Executing {} statement (commit: {}): {}",
            kind.label(),
            commit,
            sql
        );

        let pool = self.pool.clone();
        let statement = sql.to_string();
        let policy = *policy;

        let task = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let mut conn = pool
                .get()
                .map_err(|e| QueryError::new(QueryErrorKind::Connection, e.to_string(), &statement))?;

            let mut result = run_statement(&mut conn, &statement, kind, commit, &policy)
                .map_err(|e| QueryError::new(QueryErrorKind::Execution, e.to_string(), &statement))?;

            result.requires_confirmation = !commit;
            result.execution_time_ms = start.elapsed().as_millis() as u64;
            Ok::<_, QueryError>(result)
        });

        // on timeout the blocking task keeps running to completion and its result is dropped
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => {
                if let Err(e) = &result {
                    error!("Statement failed: {}", e.message);
                }
                result
            }
            Ok(Err(join_err)) => {
                error!("Task join error: {}", join_err);
                Err(QueryError::new(
                    QueryErrorKind::Execution,
                    format!("Database task execution failed: {}", join_err),
                    sql,
                ))
            }
            Err(_) if confirmed => {
                warn!("Confirmed statement exceeded {:?}, its outcome is unknown", self.timeout);
                Err(QueryError::new(
                    QueryErrorKind::Timeout,
                    format!(
                        "Statement did not finish within {:.1} seconds. It is still running, so the change may have been applied.",
                        self.timeout.as_secs_f32()
                    ),
                    sql,
                ))
            }
            Err(_) => {
                warn!("Statement exceeded {:?}, discarding its result", self.timeout);
                Err(QueryError::new(
                    QueryErrorKind::Timeout,
                    format!("Query did not finish within {:.1} seconds", self.timeout.as_secs_f32()),
                    sql,
                ))
            }
        }
    }
}

/// Classifies `sql` and rejects what the policy does not allow, without touching the database.
pub fn check_policy(sql: &str, policy: &SafetyPolicy) -> Result<StatementKind, QueryError> {
    let statements = split_statements(sql);
    if statements.len() != 1 {
        return Err(QueryError::new(
            QueryErrorKind::PolicyViolation,
            format!("Expected exactly one statement, found {}", statements.len()),
            sql,
        ));
    }

    let kind = classify(statements[0]);
    if policy.mode == SafetyMode::ReadOnly && !kind.is_read_only() {
        return Err(QueryError::new(
            QueryErrorKind::PolicyViolation,
            format!(
                "{} statements are not allowed in read-only mode; only SELECT queries can run",
                kind.label()
            ),
            sql,
        ));
    }

    Ok(kind)
}

fn run_statement(
    conn: &mut Connection,
    sql: &str,
    kind: StatementKind,
    commit: bool,
    policy: &SafetyPolicy,
) -> Result<QueryResult, duckdb::Error> {
    if kind != StatementKind::Other {
        return run_in_transaction(conn, sql, kind, commit, policy);
    }

    // only reached once confirmed
    conn.execute_batch(sql)?;
    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        total_rows: 0,
        truncated: false,
        statement: kind,
        requires_confirmation: false,
        execution_time_ms: 0,
    })
}

fn run_in_transaction(
    conn: &mut Connection,
    sql: &str,
    kind: StatementKind,
    commit: bool,
    policy: &SafetyPolicy,
) -> Result<QueryResult, duckdb::Error> {
    let tx = conn.transaction()?;

    let result = if kind == StatementKind::Select {
        collect_rows(&tx, sql, kind, policy)?
    } else {
        let affected = tx.execute(sql, [])?;
        debug!("Statement affected {} rows", affected);
        QueryResult {
            columns: vec!["rows_affected".to_string()],
            rows: vec![vec![CellValue::Int(affected as i64)]],
            total_rows: 1,
            truncated: false,
            statement: kind,
            requires_confirmation: false,
            execution_time_ms: 0,
        }
    };

    if commit {
        tx.commit()?;
    } else {
        tx.rollback()?;
        debug!("Rolled back unconfirmed {} statement", kind.label());
    }

    Ok(result)
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    kind: StatementKind,
    policy: &SafetyPolicy,
) -> Result<QueryResult, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let arrow_batches = stmt.query_arrow([])?;

    let schema = arrow_batches.get_schema();
    let columns = schema
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect::<Vec<String>>();

    let mut rows = Vec::new();
    let mut total_rows = 0;
    let mut payload = 0;
    let mut truncated = false;

    for batch in arrow_batches {
        total_rows += batch.num_rows();
        if truncated {
            continue;
        }
        for row in 0..batch.num_rows() {
            if rows.len() >= policy.max_rows {
                truncated = true;
                break;
            }
            let values = row_values(&batch, row);
            let size: usize = values.iter().map(CellValue::payload_len).sum();
            if payload + size > policy.max_payload_bytes {
                truncated = true;
                break;
            }
            payload += size;
            rows.push(values);
        }
    }

    if truncated {
        info!(
            "Result truncated to {} of {} rows ({} bytes kept)",
            rows.len(),
            total_rows,
            payload
        );
    }

    Ok(QueryResult {
        columns,
        rows,
        total_rows,
        truncated,
        statement: kind,
        requires_confirmation: false,
        execution_time_ms: 0,
    })
}

fn row_values(batch: &RecordBatch, row: usize) -> Vec<CellValue> {
    batch
        .columns()
        .iter()
        .map(|column| cell_value(column.as_ref(), row))
        .collect()
}

fn cell_value(column: &dyn Array, row: usize) -> CellValue {
    if column.is_null(row) {
        return CellValue::Null;
    }

    match column.data_type() {
        DataType::Boolean => CellValue::Bool(column.as_boolean().value(row)),
        DataType::Int8 => CellValue::Int(column.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => CellValue::Int(column.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => CellValue::Int(column.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => CellValue::Int(column.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => CellValue::Int(column.as_primitive::<UInt8Type>().value(row) as i64),
        DataType::UInt16 => CellValue::Int(column.as_primitive::<UInt16Type>().value(row) as i64),
        DataType::UInt32 => CellValue::Int(column.as_primitive::<UInt32Type>().value(row) as i64),
        DataType::UInt64 => {
            let value = column.as_primitive::<UInt64Type>().value(row);
            i64::try_from(value)
                .map(CellValue::Int)
                .unwrap_or_else(|_| CellValue::Text(value.to_string()))
        }
        DataType::Float32 => CellValue::Float(column.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => CellValue::Float(column.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => CellValue::Text(column.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => CellValue::Text(column.as_string::<i64>().value(row).to_string()),
        _ => match arrow::util::display::array_value_to_string(column, row) {
            Ok(text) => CellValue::Text(text),
            Err(e) => {
                warn!("Could not render {:?} value: {}", column.data_type(), e);
                CellValue::Text("?".to_string())
            }
        },
    }
}
