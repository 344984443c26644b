use crate::config::LlmConfig;
use crate::llm::providers::{status_error, transport_error};
use crate::llm::{ChunkStream, CompletionProvider, LlmError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const DEFAULT_API_URL: &str = "http://localhost:11434/api/generate";

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, LlmError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        Ok(response)
    }
}

/// Parses one NDJSON line; blank lines yield `None`.
fn parse_line(line: &[u8]) -> Result<Option<OllamaResponse>, LlmError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(line).map(Some).map_err(|e| {
        error!("Failed to parse Ollama stream line: {} - Line was: {}", e, line);
        LlmError::Response(format!("Failed to parse Ollama stream line: {}", e))
    })
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self.send(prompt, false).await?;

        let response_text = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = serde_json::from_str::<OllamaResponse>(&response_text).map_err(|e| {
            error!("Failed to parse Ollama response: {} - Response was: {}", e, response_text);
            LlmError::Response(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(ollama_response.response)
    }

    async fn complete_stream(&self, prompt: &str) -> Result<ChunkStream, LlmError> {
        let response = self.send(prompt, true).await?;
        let bytes = response.bytes_stream().boxed();
        let timeout = self.timeout;

        // (byte stream, unparsed tail, finished)
        let chunks = stream::unfold((bytes, Vec::<u8>::new(), false), move |(mut bytes, mut buffer, finished)| async move {
            if finished {
                return None;
            }

            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_line(&line) {
                        Ok(None) => continue,
                        Ok(Some(chunk)) => return Some((Ok(chunk.response), (bytes, buffer, chunk.done))),
                        Err(e) => return Some((Err(e), (bytes, buffer, true))),
                    }
                }

                match bytes.next().await {
                    Some(Ok(data)) => buffer.extend_from_slice(&data),
                    Some(Err(e)) => return Some((Err(transport_error(e, timeout)), (bytes, buffer, true))),
                    None => {
                        // last line may come without a trailing newline
                        let tail = std::mem::take(&mut buffer);
                        return match parse_line(&tail) {
                            Ok(None) => None,
                            Ok(Some(chunk)) => Some((Ok(chunk.response), (bytes, buffer, true))),
                            Err(e) => Some((Err(e), (bytes, buffer, true))),
                        };
                    }
                }
            }
        });

        Ok(chunks.boxed())
    }
}
