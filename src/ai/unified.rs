use crate::ai::ollama::OllamaProvider;
use crate::ai::openai_compat::{OpenAiCompatProvider, OpenAiFlavor};
use crate::ai::types::{ChatRequest, ChatResponse, LlmError, LlmProvider};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Clone)]
pub enum InnerProvider {
    OpenAiCompat(OpenAiCompatProvider),
    Ollama(OllamaProvider),
}

/// Backend chosen by `LLM_PROVIDER`; everything downstream only sees
/// `LlmProvider`.
#[derive(Clone)]
pub struct AnyProvider {
    inner: InnerProvider,
}

impl AnyProvider {
    pub fn from_env(which: &str, timeout: Duration) -> Result<Self, LlmError> {
        let which = which.trim().to_lowercase();
        if which == "ollama" {
            let p = OllamaProvider::from_env(timeout)?;
            return Ok(Self {
                inner: InnerProvider::Ollama(p),
            });
        }
        let flavor = OpenAiFlavor::parse(&which).unwrap_or(OpenAiFlavor::OpenRouter);
        let p = OpenAiCompatProvider::from_env(flavor, timeout)?;
        Ok(Self {
            inner: InnerProvider::OpenAiCompat(p),
        })
    }

    /// Model used when `LLM_MODEL` is not set.
    pub fn default_model(which: &str) -> &'static str {
        match which.trim().to_lowercase().as_str() {
            "ollama" => "qwen3:8b",
            other => OpenAiFlavor::parse(other)
                .unwrap_or(OpenAiFlavor::OpenRouter)
                .default_model(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnyProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        match &self.inner {
            InnerProvider::OpenAiCompat(p) => p.chat(req).await,
            InnerProvider::Ollama(p) => p.chat(req).await,
        }
    }

    fn name(&self) -> &str {
        match &self.inner {
            InnerProvider::OpenAiCompat(p) => p.name(),
            InnerProvider::Ollama(p) => p.name(),
        }
    }
}
