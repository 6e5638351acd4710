pub mod ollama;
pub mod openai_compat;
pub mod types;
pub mod unified;

pub use openai_compat::OpenAiFlavor;
pub use types::{ChatRequest, LlmError, LlmProvider};
pub use unified::AnyProvider;

use std::time::Duration;

pub(crate) fn build_llm_http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Ok(raw) = std::env::var("LLM_PROXY") {
        let t = raw.trim();
        if !t.is_empty() {
            let url = if t.contains("://") {
                t.to_string()
            } else {
                format!("socks5h://{}", t)
            };
            let proxy = reqwest::Proxy::all(&url).map_err(|e| LlmError::Http(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
    }

    builder.build().map_err(|e| LlmError::Http(e.to_string()))
}

pub(crate) fn map_send_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Http(e.to_string())
    }
}

/// Splits a `KEY1,KEY2;KEY3` style list into trimmed, non-empty keys.
pub(crate) fn split_keys(raw: &str) -> Vec<String> {
    raw.split(|c| c == ',' || c == ';' || c == '\n' || c == '\t' || c == ' ')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}
