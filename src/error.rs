use thiserror::Error;

use crate::config::ConfigurationError;
use crate::db::DbError;
use crate::llm::LlmError;
use crate::prompt::PromptError;

/// Startup failures of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert_and_keep_their_message() {
        let err: AppError = LlmError::Config("Unsupported LLM backend: bard".to_string()).into();
        assert_eq!(err.to_string(), "LLM configuration error: Unsupported LLM backend: bard");

        let err: AppError = DbError::Connection("refused".to_string()).into();
        assert!(matches!(err, AppError::Database(_)));
    }
}
