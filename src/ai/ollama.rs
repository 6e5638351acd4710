use crate::ai::types::{ChatRequest, ChatResponse, LlmError, LlmProvider};
use crate::ai::{build_llm_http_client, map_send_error};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Local Ollama daemon (`/api/chat`). No key required.
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn from_env(timeout: Duration) -> Result<Self, LlmError> {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        Self::new(base_url, timeout)
    }

    pub fn new(base_url: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_llm_http_client(timeout)?,
            base_url,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": req.model,
            "stream": false,
            "options": {
                "temperature": req.temperature,
                "num_predict": req.max_tokens
            },
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user}
            ]
        });

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = resp.status();
        let raw = resp.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(LlmError::status(status.as_u16(), &raw));
        }

        let v: Value = serde_json::from_str(&raw)
            .map_err(|e| LlmError::InvalidResponse(format!("json parse failed: {e}, raw={raw}")))?;
        let text = v
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .or_else(|| v.get("response").and_then(|c| c.as_str()))
            .ok_or_else(|| LlmError::InvalidResponse(format!("missing message.content, raw={raw}")))?
            .to_string();

        let truncated = v.get("done_reason").and_then(|r| r.as_str()) == Some("length");

        Ok(ChatResponse { text, truncated })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
