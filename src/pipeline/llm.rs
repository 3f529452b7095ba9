use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("Cannot connect to LLM endpoint at {0}")]
    Connection(String),

    #[error("LLM network error: {0}")]
    Network(String),

    #[error("LLM endpoint returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Transport-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::Connection(_) | LlmError::Network(_)
        )
    }
}

/// LLM client abstraction (allows mocking). One prompt in, raw reply text out.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String, LlmError>;
}

// ═══════════════════════════════════════════════════════════
// OpenAI-compatible HTTP client
// ═══════════════════════════════════════════════════════════

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn invoke(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                LlmError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                LlmError::Timeout(format!("no reply after {}s", self.timeout_secs))
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Overload and server errors are transport conditions, not bad requests.
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(LlmError::Network(format!("status {status}: {body}")));
            }
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("response has no choices".into()))
    }
}

// ═══════════════════════════════════════════════════════════
// Mock client
// ═══════════════════════════════════════════════════════════

/// Mock LLM client for testing.
///
/// Reply selection: the first rule whose needle occurs in the prompt, then the
/// scripted queue, then the default reply.
#[derive(Default)]
pub struct MockLlmClient {
    rules: Vec<(String, String)>,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    default_reply: Option<String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    /// Always answers `response`.
    pub fn new(response: &str) -> Self {
        Self {
            default_reply: Some(response.to_string()),
            ..Self::default()
        }
    }

    /// Answers from a queue, in order. An exhausted queue yields a network error.
    pub fn scripted(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answer `response` to any prompt containing `needle`.
    pub fn with_rule(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_string(), response.to_string()));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_reply = Some(response.to_string());
        self
    }

    /// Sleep before answering (for cancellation tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn invoke(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((_, reply)) = self.rules.iter().find(|(needle, _)| prompt.contains(needle)) {
            return Ok(reply.clone());
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (next, &self.default_reply) {
            (Some(reply), _) => reply,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(LlmError::Network("mock script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::Timeout("x".into()).is_transient());
        assert!(LlmError::Connection("x".into()).is_transient());
        assert!(LlmError::Network("x".into()).is_transient());
        assert!(!LlmError::MalformedResponse("x".into()).is_transient());
        assert!(!LlmError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn mock_rules_take_precedence_over_script() {
        let client = MockLlmClient::scripted(vec![Ok("queued".into())])
            .with_rule("快递", "rule reply");
        assert_eq!(client.invoke("这是快递单").await.unwrap(), "rule reply");
        assert_eq!(client.invoke("other").await.unwrap(), "queued");
        assert!(client.invoke("other").await.is_err());
        assert_eq!(client.calls(), 3);
        assert_eq!(client.prompts()[0], "这是快递单");
    }

    #[tokio::test]
    async fn mock_default_reply_repeats() {
        let client = MockLlmClient::new("{}");
        assert_eq!(client.invoke("a").await.unwrap(), "{}");
        assert_eq!(client.invoke("b").await.unwrap(), "{}");
    }

    #[test]
    fn client_trims_trailing_slash() {
        let config = LlmConfig {
            base_url: "http://localhost:8000/v1/".into(),
            ..LlmConfig::default()
        };
        let client = OpenAiCompatClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:8000/v1");
        assert_eq!(client.model(), config.model);
    }

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "m",
            messages: [ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.5,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["model"], "m");
    }

    #[test]
    fn response_first_choice_content() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("{\"a\":1}")
        );
    }
}
