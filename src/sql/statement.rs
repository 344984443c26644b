use serde::{Deserialize, Serialize};

/// Broad category of a SQL statement, used by the safety policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl StatementKind {
    pub fn is_read_only(self) -> bool {
        self == StatementKind::Select
    }

    pub fn changes_schema(self) -> bool {
        self == StatementKind::Ddl
    }

    pub fn label(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Ddl => "DDL",
            StatementKind::Other => "OTHER",
        }
    }
}

/// Walks `sql` and calls `f` with the byte offset of every character that is
/// outside string literals, quoted identifiers and comments. Returning
/// `false` from `f` stops the walk.
pub(crate) fn visit_code<F>(sql: &str, mut f: F)
where
    F: FnMut(usize, char) -> bool,
{
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                // '' inside a literal closes and reopens, which lands in the same place
                for (_, q) in chars.by_ref() {
                    if q == c {
                        break;
                    }
                }
            }
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                while let Some(&(_, n)) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = ' ';
                for (_, n) in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => {
                if !f(i, c) {
                    return;
                }
            }
        }
    }
}

/// Upper-cased bare words of `sql`, skipping literals, quoted identifiers and comments.
pub fn keywords(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    visit_code(sql, |_, c| {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c.to_ascii_uppercase());
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        true
    });
    if !current.is_empty() {
        words.push(current);
    }

    words
}

/// Splits `sql` on semicolons that are not inside literals or comments.
/// Segments holding nothing but whitespace or comments are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut boundaries = Vec::new();
    visit_code(sql, |i, c| {
        if c == ';' {
            boundaries.push(i);
        }
        true
    });

    let mut statements = Vec::new();
    let mut start = 0;
    for end in boundaries.into_iter().chain(std::iter::once(sql.len())) {
        let segment = sql[start..end].trim();
        if !keywords(segment).is_empty() {
            statements.push(segment);
        }
        start = (end + 1).min(sql.len());
    }

    statements
}

fn write_kind(word: &str) -> Option<StatementKind> {
    match word {
        "INSERT" | "MERGE" => Some(StatementKind::Insert),
        "UPDATE" => Some(StatementKind::Update),
        "DELETE" => Some(StatementKind::Delete),
        "CREATE" | "DROP" | "ALTER" | "TRUNCATE" => Some(StatementKind::Ddl),
        _ => None,
    }
}

/// Classifies a single statement by its leading keyword. A `WITH` statement
/// counts as a SELECT only when no data-modifying keyword appears anywhere in it.
pub fn classify(sql: &str) -> StatementKind {
    let words = keywords(sql);

    match words.first().map(String::as_str) {
        Some("SELECT" | "VALUES" | "FROM") => StatementKind::Select,
        Some("WITH") => words
            .iter()
            .skip(1)
            .find_map(|w| write_kind(w))
            .unwrap_or(StatementKind::Select),
        Some("INSERT" | "REPLACE" | "MERGE" | "UPSERT") => StatementKind::Insert,
        Some("UPDATE") => StatementKind::Update,
        Some("DELETE") => StatementKind::Delete,
        Some("CREATE" | "DROP" | "ALTER" | "TRUNCATE" | "RENAME" | "COMMENT") => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}
