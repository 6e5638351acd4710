use crate::ai::{ChatRequest, LlmError, LlmProvider};
use crate::generate::parser::{extract_code_block, extract_truncated_code_block};
use async_trait::async_trait;
use log::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodePrompt {
    pub system: String,
    pub user: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Backend not configured or refusing our credentials.
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    #[error("generator request failed: {0}")]
    Transport(String),
    #[error("response contained no code block")]
    NoCodeBlock,
}

impl From<LlmError> for GenerationError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::MissingEnv(_) | LlmError::Unauthorized => Self::Unavailable(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Turns a prompt into program text.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, prompt: &CodePrompt) -> Result<String, GenerationError>;
}

pub struct LlmCodeGenerator<P: LlmProvider> {
    provider: P,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl<P: LlmProvider> LlmCodeGenerator<P> {
    pub fn new(provider: P, model: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl<P: LlmProvider> CodeGenerator for LlmCodeGenerator<P> {
    async fn generate(&self, prompt: &CodePrompt) -> Result<String, GenerationError> {
        let req = ChatRequest {
            model: self.model.clone(),
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let resp = self.provider.chat(req).await.map_err(|e| {
            warn!("{} chat failed: {}", self.provider.name(), e);
            GenerationError::from(e)
        })?;
        debug!(
            "{} replied with {} chars",
            self.provider.name(),
            resp.text.len()
        );
        if resp.truncated {
            // Still worth a smoke test; a cut-off program fails fast there.
            warn!(
                "{} reply hit max_tokens={}, code may be incomplete",
                self.provider.name(),
                self.max_tokens
            );
        }
        let code = if resp.truncated {
            extract_truncated_code_block(&resp.text)
        } else {
            extract_code_block(&resp.text)
        };
        code.ok_or(GenerationError::NoCodeBlock)
    }
}

/// Stands in when no backend could be configured at startup, so runs still
/// record why they failed.
pub struct UnconfiguredGenerator {
    reason: String,
}

impl UnconfiguredGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CodeGenerator for UnconfiguredGenerator {
    async fn generate(&self, _prompt: &CodePrompt) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(self.reason.clone()))
    }
}
