use crate::config::LlmConfig;
use crate::llm::providers::{status_error, transport_error};
use crate::llm::{CompletionProvider, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Any endpoint speaking the OpenAI chat completions format.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    timeout: Duration,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::Config("API URL is required for the openai backend".to_string())
        })?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = PromptRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: 2000,
        };

        info!("Sending request to {} with model: {}", self.api_url, self.model);

        let mut builder = self.client.post(&self.api_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;

        let content = prompt_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Response("No choices in response".to_string()))?;
        debug!("Completion content: {}", content);

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            backend: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_url: Some(format!("{}/v1/chat/completions", server.uri())),
            api_key: api_key.map(str::to_string),
            ..crate::config::AppConfig::default().llm
        }
    }

    #[test]
    fn test_api_url_is_required() {
        let config = LlmConfig {
            backend: "openai".to_string(),
            api_url: None,
            ..crate::config::AppConfig::default().llm
        };
        assert!(matches!(OpenAiCompatibleProvider::new(&config), Err(LlmError::Config(_))));
    }

    #[tokio::test]
    async fn test_complete_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "SELECT 1" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(&config(&server, Some("sk-test"))).unwrap();
        assert_eq!(provider.complete("question").await.unwrap(), "SELECT 1");
    }

    #[tokio::test]
    async fn test_empty_choices_is_a_response_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(&config(&server, None)).unwrap();
        assert!(matches!(provider.complete("question").await, Err(LlmError::Response(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(&config(&server, None)).unwrap();
        assert!(provider.complete("question").await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out_through_model_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({ "choices": [{ "message": { "content": "SELECT 1" } }] })),
            )
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(&config(&server, None)).unwrap();
        let client = crate::llm::ModelClient::new(
            std::sync::Arc::new(provider),
            crate::llm::audit::AuditLog::disabled(),
            Duration::from_millis(50),
            crate::llm::RetryPolicy::new(0, Duration::from_millis(1)),
        );
        let err = client
            .complete(
                &crate::llm::models::PromptText::new("question"),
                crate::llm::models::CompletionPurpose::SqlGeneration,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
