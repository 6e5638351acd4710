use crate::ai::types::{ChatRequest, ChatResponse, LlmError, LlmProvider};
use crate::ai::{build_llm_http_client, map_send_error, split_keys};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backends that speak the OpenAI chat-completions dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenRouter,
    Groq,
    OpenAi,
    DeepSeek,
    Cerebras,
}

impl OpenAiFlavor {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Some(Self::OpenRouter),
            "groq" => Some(Self::Groq),
            "openai" => Some(Self::OpenAi),
            "deepseek" => Some(Self::DeepSeek),
            "cerebras" => Some(Self::Cerebras),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::Cerebras => "cerebras",
        }
    }

    fn key_env(self) -> &'static str {
        match self {
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::Groq => "GROQ_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::Cerebras => "CEREBRAS_API_KEY",
        }
    }

    fn keys_env(self) -> &'static str {
        match self {
            Self::OpenRouter => "OPENROUTER_API_KEYS",
            Self::Groq => "GROQ_API_KEYS",
            Self::OpenAi => "OPENAI_API_KEYS",
            Self::DeepSeek => "DEEPSEEK_API_KEYS",
            Self::Cerebras => "CEREBRAS_API_KEYS",
        }
    }

    fn base_url_env(self) -> &'static str {
        match self {
            Self::OpenRouter => "OPENROUTER_BASE_URL",
            Self::Groq => "GROQ_BASE_URL",
            Self::OpenAi => "OPENAI_BASE_URL",
            Self::DeepSeek => "DEEPSEEK_BASE_URL",
            Self::Cerebras => "CEREBRAS_BASE_URL",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Cerebras => "https://api.cerebras.ai/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenRouter => "deepseek/deepseek-r1",
            Self::Groq => "qwen/qwen3-32b",
            Self::OpenAi => "gpt-4o",
            Self::DeepSeek => "deepseek-chat",
            Self::Cerebras => "llama-3.3-70b",
        }
    }

    // Cerebras rejects `max_tokens` on some models.
    fn max_tokens_field(self) -> &'static str {
        match self {
            Self::Cerebras => "max_completion_tokens",
            _ => "max_tokens",
        }
    }
}

#[derive(Clone)]
pub struct OpenAiCompatProvider {
    flavor: OpenAiFlavor,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    api_keys: Vec<String>,
    index: Arc<AtomicUsize>,
}

impl OpenAiCompatProvider {
    pub fn from_env(flavor: OpenAiFlavor, timeout: Duration) -> Result<Self, LlmError> {
        let api_keys = std::env::var(flavor.keys_env())
            .ok()
            .map(|s| split_keys(&s))
            .unwrap_or_default();
        let api_key = if api_keys.is_empty() {
            std::env::var(flavor.key_env()).map_err(|_| LlmError::MissingEnv(flavor.key_env()))?
        } else {
            api_keys[0].clone()
        };
        let base_url = std::env::var(flavor.base_url_env())
            .unwrap_or_else(|_| flavor.default_base_url().to_string());

        Ok(Self {
            flavor,
            client: build_llm_http_client(timeout)?,
            api_key,
            base_url,
            api_keys,
            index: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn new(
        flavor: OpenAiFlavor,
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            flavor,
            client: build_llm_http_client(timeout)?,
            api_key,
            base_url,
            api_keys: Vec::new(),
            index: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn next_key(&self) -> String {
        if self.api_keys.is_empty() {
            self.api_key.clone()
        } else {
            let i = self.index.fetch_add(1, Ordering::Relaxed);
            self.api_keys[i % self.api_keys.len()].clone()
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": req.model,
            "temperature": req.temperature,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user}
            ],
            "stream": false
        });
        body[self.flavor.max_tokens_field()] = Value::from(req.max_tokens);

        let resp = self
            .client
            .post(url)
            .bearer_auth(self.next_key())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(LlmError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => return Err(LlmError::RateLimited),
            _ => {}
        }

        let status = resp.status();
        let raw = resp.text().await.map_err(map_send_error)?;

        if !status.is_success() {
            return Err(LlmError::status(status.as_u16(), &raw));
        }

        let v: Value = serde_json::from_str(&raw)
            .map_err(|e| LlmError::InvalidResponse(format!("json parse failed: {e}, raw={raw}")))?;
        let text = extract_choice_text(&v)
            .ok_or_else(|| LlmError::InvalidResponse(format!("no content in choices[0], raw={raw}")))?;

        let truncated = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|r| r.as_str())
            == Some("length");

        Ok(ChatResponse { text, truncated })
    }

    fn name(&self) -> &str {
        self.flavor.name()
    }
}

/// Pulls the assistant text out of a chat-completions body.
///
/// Accepts `choices[0].message.content` as a string or as an array of parts,
/// `choices[0].content`, `choices[0].text`, and a top-level `output_text`.
pub(crate) fn extract_choice_text(v: &Value) -> Option<String> {
    if let Some(Value::String(s)) = v.get("output_text") {
        if v.get("choices").is_none() {
            return Some(s.clone());
        }
    }
    let choice0 = v.get("choices").and_then(|c| c.get(0))?;

    let content = choice0
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice0.get("content"));

    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(arr)) => {
            let mut parts = Vec::new();
            for it in arr {
                if let Some(t) = it.get("text").and_then(|x| x.as_str()) {
                    parts.push(t.to_string());
                } else if let Some(t) = it.as_str() {
                    parts.push(t.to_string());
                }
            }
            Some(parts.join("\n"))
        }
        _ => match choice0.get("text") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        },
    }
}
