use serde::{Deserialize, Serialize};
use std::fmt;

/// One immutable version of generated strategy code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub attempt: u32,
    pub text: String,
}

impl GeneratedCode {
    pub fn new(attempt: u32, text: impl Into<String>) -> Self {
        Self {
            attempt,
            text: text.into(),
        }
    }
}

/// Inputs the backtest engine receives besides code and prices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    pub cash: f64,
    pub commission: f64,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            cash: 1_000_000.0,
            commission: 0.002,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub return_pct: f64,
    pub buy_hold_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    SyntaxError,
    RuntimeError,
    Timeout,
    InvalidResult,
    DatasetFetchError,
    GenerationError,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "SyntaxError",
            Self::RuntimeError => "RuntimeError",
            Self::Timeout => "Timeout",
            Self::InvalidResult => "InvalidResult",
            Self::DatasetFetchError => "DatasetFetchError",
            Self::GenerationError => "GenerationError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Defects in the generated code itself, which a new attempt may fix.
    pub fn is_code_defect(self) -> bool {
        matches!(
            self,
            Self::SyntaxError | Self::RuntimeError | Self::Timeout | Self::InvalidResult
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub category: FailureCategory,
    pub message: String,
    pub traceback: String,
}

/// Result of one code version against one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Success(Metrics),
    Failure(Failure),
}

impl ExecutionOutcome {
    pub fn failure(
        category: FailureCategory,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self::Failure(Failure {
            category,
            message: message.into(),
            traceback: traceback.into(),
        })
    }

    pub fn syntax(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self::failure(FailureCategory::SyntaxError, message, traceback)
    }

    pub fn runtime(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self::failure(FailureCategory::RuntimeError, message, traceback)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::failure(FailureCategory::Timeout, message, "")
    }

    pub fn invalid(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self::failure(FailureCategory::InvalidResult, message, traceback)
    }

    pub fn fetch_error(message: impl Into<String>) -> Self {
        Self::failure(FailureCategory::DatasetFetchError, message, "")
    }

    pub fn cancelled() -> Self {
        Self::failure(FailureCategory::Cancelled, "run cancelled before execution", "")
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        match self {
            Self::Success(m) => Some(m),
            Self::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
