pub mod audit;
pub mod models;
pub mod providers;

use crate::config::LlmConfig;
use crate::llm::audit::AuditLog;
use crate::llm::models::{AuditRecord, CompletionPurpose, ModelResponse, PromptText};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    /// The endpoint could not be reached or answered with a server error
    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Model did not respond within {} seconds", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("LLM response error: {0}")]
    Response(String),

    #[error("LLM configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Unavailable and timeout errors may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Unavailable(_) | LlmError::Timeout(_))
    }
}

/// Finite stream of text chunks; it cannot be restarted.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// One completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Backends without native streaming hand back the whole answer as one chunk.
    async fn complete_stream(&self, prompt: &str) -> Result<ChunkStream, LlmError> {
        let text = self.complete(prompt).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// Picks the provider named by `config.backend`.
pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>, LlmError> {
    let provider: Arc<dyn CompletionProvider> = match config.backend.as_str() {
        "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
        "openai" => Arc::new(providers::openai::OpenAiCompatibleProvider::new(config)?),
        _ => {
            return Err(LlmError::Config(format!(
                "Unsupported LLM backend: {}",
                config.backend
            )))
        }
    };

    Ok(provider)
}

/// Timeout, retry and audit policy around a [`CompletionProvider`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.min(2),
            base_delay,
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.pow(retry)
    }
}

pub struct ModelClient {
    provider: Arc<dyn CompletionProvider>,
    audit: AuditLog,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, audit: AuditLog, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            provider,
            audit,
            timeout,
            retry,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = provider_from_config(config)?;
        let audit = match &config.audit_log_path {
            Some(path) => AuditLog::open(path),
            None => AuditLog::disabled(),
        };
        Ok(Self::new(
            provider,
            audit,
            config.timeout(),
            RetryPolicy::new(config.max_retries, Duration::from_millis(config.retry_backoff_ms)),
        ))
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// One attempt, bounded by the configured timeout. Always audited.
    pub async fn complete(&self, prompt: &PromptText, purpose: CompletionPurpose) -> Result<ModelResponse, LlmError> {
        self.attempt(prompt, purpose, 1).await
    }

    /// Retries unavailable/timeout failures with exponential backoff, at most twice.
    pub async fn complete_with_retry(
        &self,
        prompt: &PromptText,
        purpose: CompletionPurpose,
    ) -> Result<ModelResponse, LlmError> {
        let mut attempt = 1;
        loop {
            match self.attempt(prompt, purpose, attempt).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!("Model call failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Model call failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &PromptText,
        purpose: CompletionPurpose,
        attempt: u32,
    ) -> Result<ModelResponse, LlmError> {
        info!("Sending {:?} request to model {} (attempt {})", purpose, self.model(), attempt);
        let start = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.provider.complete(prompt.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        self.audit.record(AuditRecord {
            timestamp: chrono::Utc::now(),
            model: self.model().to_string(),
            purpose,
            attempt,
            prompt: prompt.as_str().to_string(),
            response: outcome.as_ref().ok().cloned(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            duration_ms,
        });

        let text = outcome?;
        debug!("Model answered in {} ms: {}", duration_ms, text);

        Ok(ModelResponse {
            text,
            model: self.model().to_string(),
            attempts: attempt,
            duration_ms,
        })
    }

    /// Streams the answer chunk by chunk, handing each chunk to `on_chunk` and
    /// returning the whole text. Retries like [`ModelClient::complete_with_retry`]
    /// until the first chunk has been handed out.
    pub async fn complete_streaming(
        &self,
        prompt: &PromptText,
        purpose: CompletionPurpose,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ModelResponse, LlmError> {
        let mut attempt = 1;
        loop {
            let start = Instant::now();
            let mut delivered = false;
            let outcome = self.drain_stream(prompt, purpose, attempt, on_chunk, &mut delivered).await;

            match outcome {
                Ok(text) => {
                    return Ok(ModelResponse {
                        text,
                        model: self.model().to_string(),
                        attempts: attempt,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) if e.is_retryable() && !delivered && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!("Model stream failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Model stream failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn drain_stream(
        &self,
        prompt: &PromptText,
        purpose: CompletionPurpose,
        attempt: u32,
        on_chunk: &mut (dyn FnMut(&str) + Send),
        delivered: &mut bool,
    ) -> Result<String, LlmError> {
        let mut chunks = self.open_stream(prompt, purpose, attempt).await?;
        let mut text = String::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            *delivered = true;
            on_chunk(&chunk);
            text.push_str(&chunk);
        }
        Ok(text)
    }

    /// Streams the answer chunk by chunk. Each chunk must arrive within the
    /// timeout; one audit record is written when the stream ends.
    pub async fn stream(&self, prompt: &PromptText, purpose: CompletionPurpose) -> Result<ChunkStream, LlmError> {
        self.open_stream(prompt, purpose, 1).await
    }

    async fn open_stream(
        &self,
        prompt: &PromptText,
        purpose: CompletionPurpose,
        attempt: u32,
    ) -> Result<ChunkStream, LlmError> {
        info!("Streaming {:?} request from model {} (attempt {})", purpose, self.model(), attempt);
        let start = Instant::now();
        let mut audit = StreamAudit {
            log: self.audit.clone(),
            model: self.model().to_string(),
            purpose,
            attempt,
            prompt: prompt.as_str().to_string(),
            start,
        };

        let opened = match tokio::time::timeout(self.timeout, self.provider.complete_stream(prompt.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        };
        let inner = match opened {
            Ok(inner) => inner,
            Err(e) => {
                audit.finish(None, Some(&e));
                return Err(e);
            }
        };

        let timeout = self.timeout;
        let state = (inner, String::new(), Some(audit));
        let chunks = stream::unfold(state, move |(mut inner, mut text, audit)| async move {
            let Some(mut audit) = audit else {
                return None;
            };
            let next = match tokio::time::timeout(timeout, inner.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(LlmError::Timeout(timeout))),
            };

            match next {
                Some(Ok(chunk)) => {
                    text.push_str(&chunk);
                    Some((Ok(chunk), (inner, text, Some(audit))))
                }
                Some(Err(e)) => {
                    audit.finish(Some(&text), Some(&e));
                    Some((Err(e), (inner, text, None)))
                }
                None => {
                    audit.finish(Some(&text), None);
                    None
                }
            }
        });

        Ok(chunks.boxed())
    }
}

struct StreamAudit {
    log: AuditLog,
    model: String,
    purpose: CompletionPurpose,
    attempt: u32,
    prompt: String,
    start: Instant,
}

impl StreamAudit {
    fn finish(&mut self, text: Option<&str>, error: Option<&LlmError>) {
        self.log.record(AuditRecord {
            timestamp: chrono::Utc::now(),
            model: self.model.clone(),
            purpose: self.purpose,
            attempt: self.attempt,
            prompt: std::mem::take(&mut self.prompt),
            response: text.map(str::to_string),
            success: error.is_none(),
            error: error.map(|e| e.to_string()),
            duration_ms: self.start.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted provider: hands out queued answers in order, then repeats the last one.
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        pub calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        pub fn answering(text: &str) -> Self {
            Self::new(vec![Ok(text.to_string())])
        }

        pub fn slow(text: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::answering(text)
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    fn clone_reply(reply: &Result<String, LlmError>) -> Result<String, LlmError> {
        match reply {
            Ok(text) => Ok(text.clone()),
            Err(LlmError::Unavailable(m)) => Err(LlmError::Unavailable(m.clone())),
            Err(LlmError::Timeout(d)) => Err(LlmError::Timeout(*d)),
            Err(LlmError::Response(m)) => Err(LlmError::Response(m.clone())),
            Err(LlmError::Config(m)) => Err(LlmError::Config(m.clone())),
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                clone_reply(replies.front().unwrap())
            }
        }
    }
}
