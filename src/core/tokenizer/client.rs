use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One turn of a chat-shaped tokenize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The two input shapes a tokenizer endpoint accepts, per SPEC_FULL.md
/// §4.4: a raw completion string, or a chat transcript rendered through
/// the model's chat template with a trailing generation prompt.
#[derive(Debug, Clone)]
pub enum TokenizeInput {
    Completion(String),
    Chat(Vec<ChatMessage>),
}

#[derive(Serialize)]
struct CompletionRequestBody<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    messages: &'a [ChatMessage],
    add_generation_prompt: bool,
}

#[derive(Deserialize)]
struct TokenizeResponse {
    #[serde(default)]
    tokens: Vec<u32>,
    #[serde(default)]
    count: Option<usize>,
}

/// A remote tokenizer client bound to one pod endpoint. Retries POSTs with
/// exponential backoff on 408/429/5xx, matching the engine adapter's
/// retry shape.
pub struct TokenizerClient {
    http: Client,
    endpoint: String,
    max_retries: u32,
    base_backoff: Duration,
}

impl TokenizerClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("tokenizer http client"),
            endpoint: endpoint.into(),
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Liveness probe: any response (even an error status less severe than
    /// a network failure) counts as healthy, matching a simple reachability
    /// check rather than a full tokenize round-trip.
    pub async fn probe(&self) -> bool {
        self.http.get(&self.endpoint).send().await.is_ok()
    }

    pub async fn tokenize(&self, input: TokenizeInput) -> Result<Vec<u32>> {
        let body = match &input {
            TokenizeInput::Completion(text) => {
                serde_json::to_value(CompletionRequestBody { prompt: text })?
            }
            TokenizeInput::Chat(messages) => serde_json::to_value(ChatRequestBody {
                messages,
                add_generation_prompt: true,
            })?,
        };

        let mut attempt = 0;
        loop {
            let outcome = self.http.post(&self.endpoint).json(&body).send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: TokenizeResponse = resp
                            .json()
                            .await
                            .map_err(|e| anyhow!("decoding tokenize response: {e}"))?;
                        return Ok(parsed.tokens);
                    }
                    if !is_retryable_status(status) || attempt >= self.max_retries {
                        return Err(anyhow!("{} returned {status}", self.endpoint));
                    }
                }
                Err(e) if attempt >= self.max_retries => {
                    return Err(anyhow!("calling {}: {e}", self.endpoint));
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, attempt, error = %e, "tokenizer request failed, retrying");
                }
            }
            tokio::time::sleep(self.base_backoff * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn completion_body_serializes_prompt_field() {
        let body = serde_json::to_value(CompletionRequestBody { prompt: "hi" }).unwrap();
        assert_eq!(body["prompt"], "hi");
    }

    #[test]
    fn chat_body_always_sets_generation_prompt() {
        let messages = vec![ChatMessage { role: "user".into(), content: "hi".into() }];
        let body = serde_json::to_value(ChatRequestBody {
            messages: &messages,
            add_generation_prompt: true,
        })
        .unwrap();
        assert_eq!(body["add_generation_prompt"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
