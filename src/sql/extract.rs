use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

use crate::sql::statement::visit_code;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:sqlite|sql|postgresql|postgres|mysql|duckdb)?[ \t]*(.*?)```")
        .expect("fenced block pattern is valid")
});

static FENCE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```(?:sqlite|sql|postgresql|postgres|mysql|duckdb)?").expect("fence marker pattern is valid")
});

// Keyword at the start of a line, after optional markdown and an "Answer:"-style label
static LINE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s>*_`#-]*(?:(?:final\s+)?(?:answer|sql\s+query|sql|query)\s*:\s*)?[`*_]*\s*(select|insert|update|delete|with|create|drop|alter|truncate)\b",
    )
    .expect("line start pattern is valid")
});

static STATEMENT_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^(?:select\b|with\s+(?:recursive\s+)?[\w"]+\s*(?:\(|as\b)|insert\s+(?:or\s+\w+\s+)?into\b|update\s+\S+\s+set\b|delete\s+from\b|create\s+(?:or\s+replace\s+)?(?:temp(?:orary)?\s+)?(?:unique\s+)?(?:table|view|index|schema|sequence|macro)\b|drop\s+(?:table|view|index|schema|sequence|macro)\b|alter\s+(?:table|view)\b|truncate\s+(?:table\s+)?[\w".]+[ \t]*(?:;|\r?\n|$))"#,
    )
    .expect("statement shape pattern is valid")
});

const PROSE_STARTERS: &[&str] = &[
    "this", "the", "here", "note", "explanation", "it", "i", "these", "that", "explanation:",
];

/// Whether a model response yielded exactly one usable statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Valid,
    Ambiguous { candidates: usize },
}

/// The model's raw answer together with the statement pulled out of it.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuery {
    pub raw_model_text: String,
    pub extracted_sql: Option<String>,
    pub validation_verdict: ValidationVerdict,
}

impl GeneratedQuery {
    pub fn sql(&self) -> Option<&str> {
        match self.validation_verdict {
            ValidationVerdict::Valid => self.extracted_sql.as_deref(),
            ValidationVerdict::Ambiguous { .. } => None,
        }
    }
}

/// Isolates a single SQL statement from a model response.
///
/// Fenced code blocks win over surrounding prose. When no block holds a
/// statement the whole response is scanned, cutting each statement at a
/// semicolon, a blank line or a line that reads like explanation. Zero or
/// several candidates yield [`ValidationVerdict::Ambiguous`].
pub fn extract_sql(raw_text: &str) -> GeneratedQuery {
    let text = strip_reasoning(raw_text);

    let fenced: Vec<Vec<String>> = FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|block| find_statements(block.as_str(), true))
        .filter(|statements| !statements.is_empty())
        .collect();

    let candidates: Vec<String> = if fenced.is_empty() {
        let unfenced = FENCE_MARKER.replace_all(text, "\n");
        find_statements(&unfenced, false)
    } else {
        fenced.into_iter().flatten().collect()
    };

    debug!("Found {} candidate statement(s) in model response", candidates.len());

    if candidates.len() == 1 {
        GeneratedQuery {
            raw_model_text: raw_text.to_string(),
            extracted_sql: candidates.into_iter().next(),
            validation_verdict: ValidationVerdict::Valid,
        }
    } else {
        GeneratedQuery {
            raw_model_text: raw_text.to_string(),
            extracted_sql: None,
            validation_verdict: ValidationVerdict::Ambiguous {
                candidates: candidates.len(),
            },
        }
    }
}

fn strip_reasoning(text: &str) -> &str {
    if let Some(end) = text.rfind("</think>") {
        return &text[end + "</think>".len()..];
    }
    match text.find("<think>") {
        Some(start) => &text[..start],
        None => text,
    }
}

fn find_statements(text: &str, fenced: bool) -> Vec<String> {
    let mut statements = Vec::new();
    let mut rest = text;

    while let Some(start) = find_statement_start(rest) {
        let body = &rest[start..];
        let end = statement_end(body, fenced);
        let statement = clean_statement(&body[..end]);
        if !statement.is_empty() {
            statements.push(statement);
        }
        if end == 0 {
            break;
        }
        rest = &body[end..];
    }

    statements
}

fn find_statement_start(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(keyword) = LINE_START.captures(line).and_then(|caps| caps.get(1)) {
            let start = offset + keyword.start();
            if STATEMENT_SHAPE.is_match(&text[start..]) {
                return Some(start);
            }
        }
        offset += line.len();
    }
    None
}

fn starts_statement(line: &str) -> bool {
    LINE_START
        .captures(line)
        .and_then(|caps| caps.get(1))
        .is_some_and(|keyword| STATEMENT_SHAPE.is_match(&line[keyword.start()..]))
}

fn looks_like_prose(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches([',', ':'])
        .to_lowercase();

    PROSE_STARTERS.contains(&first.as_str())
        || ((trimmed.ends_with('.') || trimmed.ends_with(':')) && !trimmed.ends_with(".."))
}

/// Byte offset where the statement at the head of `body` stops.
fn statement_end(body: &str, fenced: bool) -> usize {
    let mut end = body.len();
    let mut depth = 0i32;

    visit_code(body, |i, c| match c {
        ';' => {
            end = i + 1;
            false
        }
        '(' => {
            depth += 1;
            true
        }
        ')' => {
            depth -= 1;
            true
        }
        '\n' => {
            let rest = &body[i + 1..];
            let next_line = rest.lines().next().unwrap_or_default();

            if next_line.trim_start().starts_with("```") {
                end = i;
                return false;
            }
            if !fenced && (next_line.trim().is_empty() || looks_like_prose(next_line)) {
                end = i;
                return false;
            }
            if fenced && next_line.trim().is_empty() && depth <= 0 {
                let following = rest.lines().find(|l| !l.trim().is_empty());
                if following.is_some_and(starts_statement) {
                    end = i;
                    return false;
                }
            }
            true
        }
        _ => true,
    });

    end
}

fn clean_statement(raw: &str) -> String {
    let mut statement = raw.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if statement.ends_with('`') && statement.matches('`').count() % 2 == 1 {
        statement = statement[..statement.len() - 1].trim_end();
    }

    statement
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted(raw: &str) -> String {
        let query = extract_sql(raw);
        assert_eq!(query.validation_verdict, ValidationVerdict::Valid, "response: {raw}");
        query.extracted_sql.unwrap_or_default()
    }

    #[test]
    fn test_plain_statement() {
        assert_eq!(
            extracted("SELECT COUNT(*) FROM customers WHERE country = 'Spain'"),
            "SELECT COUNT(*) FROM customers WHERE country = 'Spain'"
        );
    }

    #[test]
    fn test_code_fence_with_language_tag() {
        let raw = "Sure! Here is the query:\n\n```sql\nSELECT COUNT(*)\nFROM customers\nWHERE country = 'Spain';\n```\n\nThis counts the customers in Spain.";
        assert_eq!(extracted(raw), "SELECT COUNT(*)\nFROM customers\nWHERE country = 'Spain'");
    }

    #[test]
    fn test_code_fence_without_language_tag() {
        let raw = "```\nselect name from customers\n```";
        assert_eq!(extracted(raw), "select name from customers");
    }

    #[test]
    fn test_unpaired_closing_fence() {
        let raw = "SELECT id FROM orders WHERE total > 100;\n```";
        assert_eq!(extracted(raw), "SELECT id FROM orders WHERE total > 100");
    }

    #[test]
    fn test_answer_prefix() {
        assert_eq!(
            extracted("Answer: SELECT name FROM customers;"),
            "SELECT name FROM customers"
        );
        assert_eq!(
            extracted("SQL query: SELECT name FROM customers"),
            "SELECT name FROM customers"
        );
    }

    #[test]
    fn test_trailing_prose_is_cut() {
        let raw = "SELECT name FROM customers WHERE country = 'Spain'\nThis query returns every customer located in Spain.";
        assert_eq!(extracted(raw), "SELECT name FROM customers WHERE country = 'Spain'");

        let raw = "SELECT name FROM customers\n\nIt lists all names.";
        assert_eq!(extracted(raw), "SELECT name FROM customers");
    }

    #[test]
    fn test_reasoning_block_is_ignored() {
        let raw = "<think>\nMaybe SELECT * FROM customers; or SELECT 1;\n</think>\nSELECT COUNT(*) FROM customers;";
        assert_eq!(extracted(raw), "SELECT COUNT(*) FROM customers");
    }

    #[test]
    fn test_semicolon_inside_literal() {
        let raw = "SELECT * FROM notes WHERE body = 'a; b';";
        assert_eq!(extracted(raw), "SELECT * FROM notes WHERE body = 'a; b'");
    }

    #[test]
    fn test_subquery_on_its_own_line() {
        let raw = "SELECT name FROM customers\nWHERE id IN (\n  SELECT customer_id FROM orders\n);";
        assert_eq!(
            extracted(raw),
            "SELECT name FROM customers\nWHERE id IN (\n  SELECT customer_id FROM orders\n)"
        );
    }

    #[test]
    fn test_with_statement() {
        let raw = "```sql\nWITH spain AS (\n  SELECT * FROM customers WHERE country = 'Spain'\n)\nSELECT COUNT(*) FROM spain;\n```";
        assert_eq!(
            extracted(raw),
            "WITH spain AS (\n  SELECT * FROM customers WHERE country = 'Spain'\n)\nSELECT COUNT(*) FROM spain"
        );
    }

    #[test]
    fn test_schema_statements() {
        assert_eq!(extracted("DROP TABLE customers;"), "DROP TABLE customers");
        assert_eq!(
            extracted("```sql\nCREATE TABLE notes (\n  id INTEGER,\n  body VARCHAR\n);\n```"),
            "CREATE TABLE notes (\n  id INTEGER,\n  body VARCHAR\n)"
        );
        assert_eq!(
            extracted("ALTER TABLE customers ADD COLUMN email VARCHAR"),
            "ALTER TABLE customers ADD COLUMN email VARCHAR"
        );
        assert_eq!(extracted("TRUNCATE customers;"), "TRUNCATE customers");
    }

    #[test]
    fn test_prose_with_schema_verbs_is_not_a_statement() {
        let query = extract_sql("Create a table first, then drop the old one.\nAlter your question and try again.");
        assert_eq!(query.validation_verdict, ValidationVerdict::Ambiguous { candidates: 0 });
    }

    #[test]
    fn test_no_statement_is_ambiguous() {
        let query = extract_sql("I'm sorry, I cannot answer that question with the given schema.");
        assert_eq!(query.validation_verdict, ValidationVerdict::Ambiguous { candidates: 0 });
        assert!(query.extracted_sql.is_none());
        assert!(query.sql().is_none());
    }

    #[test]
    fn test_two_statements_are_ambiguous() {
        let query = extract_sql("SELECT 1 FROM t; SELECT 2 FROM t;");
        assert_eq!(query.validation_verdict, ValidationVerdict::Ambiguous { candidates: 2 });

        let query = extract_sql("```sql\nSELECT * FROM a;\n```\nor\n```sql\nSELECT * FROM b;\n```");
        assert_eq!(query.validation_verdict, ValidationVerdict::Ambiguous { candidates: 2 });

        let query = extract_sql("```sql\nSELECT * FROM a\n\nSELECT * FROM b\n```");
        assert_eq!(query.validation_verdict, ValidationVerdict::Ambiguous { candidates: 2 });
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let responses = [
            "```sql\nSELECT c.name, COUNT(o.id)\n\nFROM customers c\nJOIN orders o ON o.customer_id = c.id\nGROUP BY c.name;\n```",
            "Answer: DELETE FROM customers WHERE country = 'Spain';",
            "UPDATE customers SET country = 'ES' WHERE country = 'Spain'\n\nThis renames the country.",
        ];

        for raw in responses {
            let first = extracted(raw);
            assert_eq!(extracted(&first), first);
        }
    }

    #[test]
    fn test_raw_text_is_preserved() {
        let raw = "```sql\nSELECT 1\n```";
        assert_eq!(extract_sql(raw).raw_model_text, raw);
    }
}
