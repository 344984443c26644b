// Text-level handling of SQL: pulling a statement out of model output and
// classifying it for the safety policy. Neither part is a SQL parser.
pub mod extract;
pub mod statement;

pub use extract::{extract_sql, ValidationVerdict};
pub use statement::{classify, split_statements, StatementKind};
