pub mod client;
pub mod parser;
pub mod prompt;

pub use client::{CodeGenerator, LlmCodeGenerator, UnconfiguredGenerator};
pub use prompt::PromptBuilder;
