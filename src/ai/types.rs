use async_trait::async_trait;

/// One system + user exchange; the only shape code generation needs.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    /// The backend stopped at `max_tokens`; generated code is likely cut off.
    pub truncated: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("missing env {0}")]
    MissingEnv(&'static str),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("credentials rejected")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected response body: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Non-2xx reply; the body is cut so one bad reply cannot flood the log.
    pub fn status(status: u16, body: &str) -> Self {
        const BODY_LIMIT: usize = 500;
        let mut end = body.len().min(BODY_LIMIT);
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        Self::Status {
            status,
            body: body[..end].to_string(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Short backend name used in logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_body_is_bounded() {
        let long = "é".repeat(400);
        match LlmError::status(502, &long) {
            LlmError::Status { status, body } => {
                assert_eq!(status, 502);
                assert!(body.len() <= 500);
                assert!(long.starts_with(&body));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
