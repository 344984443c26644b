pub mod ollama;
pub mod openai;

use crate::llm::LlmError;
use crate::util::redact::redact;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::error;

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        LlmError::Unavailable(redact(&e.to_string()))
    } else {
        LlmError::Response(redact(&e.to_string()))
    }
}

/// Server errors and rate limiting are worth another attempt, anything else is not.
pub(crate) fn status_error(status: StatusCode, body: &str) -> LlmError {
    let body = if body.is_empty() {
        String::new()
    } else {
        format!(" - Response body: {}", body)
    };
    let message = redact(&format!("API responded with status code: {}{}", status, body));
    error!("{}", message);

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::Unavailable(message)
    } else {
        LlmError::Response(message)
    }
}
