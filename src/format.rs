use serde::Serialize;
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::db::executor::{CellValue, QueryError, QueryErrorKind, QueryResult};
use crate::llm::models::CompletionPurpose;
use crate::llm::ModelClient;
use crate::prompt::PromptBuilder;
use crate::util::redact::redact;

/// Longest error message shown to the user, in characters
const MAX_ERROR_CHARS: usize = 500;

/// What the user sees for one turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisplayText {
    /// Markdown
    pub text: String,
    pub sql: Option<String>,
    pub preview_rows: usize,
    pub total_rows: usize,
    pub truncated: bool,
    pub awaiting_confirmation: bool,
}

impl DisplayText {
    /// A plain message with no query attached.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub struct ResultFormatter {
    preview_rows: usize,
}

impl ResultFormatter {
    pub fn new(preview_rows: usize) -> Self {
        Self { preview_rows }
    }

    pub fn format(&self, sql: &str, outcome: &Result<QueryResult, QueryError>) -> DisplayText {
        match outcome {
            Ok(result) if result.requires_confirmation => self.format_pending(sql, result),
            Ok(result) => self.format_rows(sql, result),
            Err(error) => self.format_error(error),
        }
    }

    fn format_rows(&self, sql: &str, result: &QueryResult) -> DisplayText {
        let mut text = sql_block(sql);

        if result.rows.is_empty() && result.total_rows == 0 {
            text.push_str("No results found.");
            return DisplayText {
                text,
                sql: Some(sql.to_string()),
                ..DisplayText::default()
            };
        }

        let shown = result.rows.len().min(self.preview_rows);
        text.push_str("**Query Results:**\n\n");
        text.push_str(&markdown_table(&result.columns, &result.rows[..shown]));
        text.push('\n');

        if shown < result.total_rows {
            let _ = write!(text, "Showing {} of {} rows", shown, result.total_rows);
            if result.truncated {
                text.push_str(" (result was truncated)");
            }
            text.push('.');
        } else {
            let _ = write!(
                text,
                "{} row(s), {} column(s).",
                result.total_rows,
                result.columns.len()
            );
        }

        DisplayText {
            text,
            sql: Some(sql.to_string()),
            preview_rows: shown,
            total_rows: result.total_rows,
            truncated: result.truncated || shown < result.total_rows,
            awaiting_confirmation: false,
        }
    }

    fn format_pending(&self, sql: &str, result: &QueryResult) -> DisplayText {
        let affected = affected_rows(result);
        let mut text = sql_block(sql);
        match affected {
            Some(affected) => {
                let _ = write!(
                    text,
                    "This {} statement would affect {} row(s). ",
                    result.statement.label(),
                    affected
                );
            }
            None => text.push_str("This statement cannot be previewed, its effects are not transactional. "),
        }
        text.push_str("Nothing has been changed yet.\n\nConfirm to apply it, or cancel to discard it.");

        DisplayText {
            text,
            sql: Some(sql.to_string()),
            preview_rows: 0,
            total_rows: affected.unwrap_or(0).max(0) as usize,
            truncated: false,
            awaiting_confirmation: true,
        }
    }

    /// Outcome of a confirmed write.
    pub fn format_applied(&self, sql: &str, outcome: &Result<QueryResult, QueryError>) -> DisplayText {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => return self.format_error(error),
        };

        let affected = affected_rows(result);
        let mut text = sql_block(sql);
        match affected {
            Some(affected) => {
                let _ = write!(
                    text,
                    "{} applied, {} row(s) affected.",
                    result.statement.label(),
                    affected
                );
            }
            None => text.push_str("Statement applied."),
        }

        DisplayText {
            text,
            sql: Some(sql.to_string()),
            total_rows: affected.unwrap_or(0).max(0) as usize,
            ..DisplayText::default()
        }
    }

    pub fn format_error(&self, error: &QueryError) -> DisplayText {
        let heading = match error.kind {
            QueryErrorKind::PolicyViolation => "Query not allowed",
            QueryErrorKind::Execution => "Query failed",
            QueryErrorKind::Timeout => "Query timed out",
            QueryErrorKind::Connection => "Database unavailable",
        };

        let mut text = sql_block(&error.failed_sql);
        let _ = write!(text, "**{}:** {}", heading, bounded(&redact(&error.message)));

        DisplayText {
            text,
            sql: Some(error.failed_sql.clone()),
            ..DisplayText::default()
        }
    }

    /// Asks the model for a one-sentence answer to put above the table.
    /// A failure is logged and yields `None`; the table stands on its own.
    pub async fn gloss(
        &self,
        model: &ModelClient,
        prompts: &PromptBuilder,
        question: &str,
        sql: &str,
        result: &QueryResult,
    ) -> Option<String> {
        let prompt = match prompts.build_summary_prompt(question, sql, result) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not build summary prompt: {}", e);
                return None;
            }
        };

        match model.complete(&prompt, CompletionPurpose::ResultSummary).await {
            Ok(response) => {
                let sentence = response.text.trim().lines().next().unwrap_or_default().trim().to_string();
                debug!("Result summary: {}", sentence);
                (!sentence.is_empty()).then_some(sentence)
            }
            Err(e) => {
                warn!("Result summary failed, showing the table alone: {}", e);
                None
            }
        }
    }
}

fn sql_block(sql: &str) -> String {
    format!("```sql\n{}\n```\n\n", sql)
}

/// `None` for statements that report no row count.
fn affected_rows(result: &QueryResult) -> Option<i64> {
    match result.rows.first().and_then(|row| row.first()) {
        Some(CellValue::Int(n)) => Some(*n),
        _ => None,
    }
}

fn bounded(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(MAX_ERROR_CHARS).collect();
    cut.push_str("...");
    cut
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace(['\n', '\r'], " ")
}

pub fn markdown_table(columns: &[String], rows: &[Vec<CellValue>]) -> String {
    let mut out = String::new();

    let header: Vec<String> = columns.iter().map(|c| escape_cell(c)).collect();
    let _ = writeln!(out, "| {} |", header.join(" | "));
    let _ = writeln!(out, "| {} |", vec!["---"; columns.len()].join(" | "));

    for row in rows {
        let cells: Vec<String> = row.iter().map(|cell| escape_cell(&cell.to_string())).collect();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }

    out
}

/// One line for the conversation history: counts, column names and at most one short row.
pub fn summarize_for_history(outcome: &Result<QueryResult, QueryError>) -> String {
    match outcome {
        Ok(result) if result.requires_confirmation => match affected_rows(result) {
            Some(affected) => format!(
                "{} awaiting confirmation, would affect {} row(s)",
                result.statement.label(),
                affected
            ),
            None => "awaiting confirmation, not previewed".to_string(),
        },
        Ok(result) if result.total_rows == 0 => "no rows".to_string(),
        Ok(result) => {
            let mut summary = format!(
                "{} row(s); columns: {}",
                result.total_rows,
                result.columns.join(", ")
            );
            if result.total_rows == 1 {
                if let Some(row) = result.rows.first() {
                    let values: Vec<String> = row.iter().map(ToString::to_string).collect();
                    let line = values.join(", ");
                    if line.chars().count() <= 80 {
                        let _ = write!(summary, "; value: {}", line);
                    }
                }
            }
            summary
        }
        Err(error) => format!("error ({:?}): {}", error.kind, bounded(&redact(&error.message))),
    }
}
