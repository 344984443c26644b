use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully rendered prompt text sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptText(String);

impl PromptText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PromptText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// What a model call is for; recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPurpose {
    SqlGeneration,
    ResultSummary,
}

// Output of one completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    pub attempts: u32,
    pub duration_ms: u64,
}

// One line of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub model: String,
    pub purpose: CompletionPurpose,
    pub attempt: u32,
    pub prompt: String,
    pub response: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}
