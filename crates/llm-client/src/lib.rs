pub mod error;

pub use error::{LlmError, LlmResult};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// One tool invocation chosen by the model. Arguments stay a raw JSON
/// string; the decision runner parses them into typed shapes.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Option<Usage>,
    /// Proxy-issued request id; stored as the trace id.
    pub request_id: Option<String>,
}

/// Backend seam for the decision runner: the production implementation is
/// the HTTP proxy client, tests script responses.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One chat-completions request with `tool_choice = required`.
    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        tools: &[serde_json::Value],
    ) -> LlmResult<ChatResponse>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LITELLM_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            api_key: std::env::var("LITELLM_API_KEY").unwrap_or_default(),
            timeout: Duration::from_secs(60),
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

/// Chat-completions client for the LLM proxy.
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    tools: &'a [serde_json::Value],
    tool_choice: &'a str,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn parse_response(body: WireResponse) -> LlmResult<ChatResponse> {
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id.unwrap_or_default(),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls,
            model: body.model.unwrap_or_default(),
            usage: body.usage,
            request_id: body.id,
        })
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        tools: &[serde_json::Value],
    ) -> LlmResult<ChatResponse> {
        let request = WireRequest {
            model,
            messages: vec![
                WireMessage { role: "system", content: system },
                WireMessage { role: "user", content: user },
            ],
            tools,
            tool_choice: "required",
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(model, "sending chat request ({} chars)", user.len());

        let mut req = self.client.post(self.endpoint()).json(&request);
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: WireResponse = resp.json().await?;
        let parsed = Self::parse_response(body)?;

        if let Some(usage) = &parsed.usage {
            tracing::info!(
                "tokens: {} prompt + {} completion = {} total",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens
            );
        }

        Ok(parsed)
    }
}
