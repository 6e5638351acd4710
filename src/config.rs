use crate::backtest::model::ExecutionParams;
use crate::backtest::worker::SandboxConfig;
use crate::dataset::DatasetSpec;
use crate::run::{RunConfig, Thresholds};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}={value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

pub const DEFAULT_DATASETS: &str = "BTCUSDT:1h:30d:binance,ETHUSDT:1h:30d:binance,SOLUSDT:4h:90d:binance";

/// Process configuration, read once at startup from the environment (and
/// `.env`) and then passed down explicitly.
#[derive(Clone, Debug)]
pub struct ForgeConfig {
    pub database_url: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout: Duration,
    pub max_debug_iterations: u32,
    pub worker_budget: usize,
    pub thresholds: Thresholds,
    pub datasets: Vec<DatasetSpec>,
    pub params: ExecutionParams,
    pub sandbox: SandboxConfig,
    pub data_cache_dir: Option<PathBuf>,
    pub csv_data_dir: PathBuf,
}

impl ForgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let llm_provider = var("LLM_PROVIDER")
            .unwrap_or_else(|| "openrouter".to_string())
            .to_ascii_lowercase();
        if llm_provider != "ollama" && crate::ai::OpenAiFlavor::parse(&llm_provider).is_none() {
            return Err(ConfigError::Invalid {
                key: "LLM_PROVIDER",
                value: llm_provider,
                reason: "expected openrouter, groq, openai, deepseek, cerebras or ollama".to_string(),
            });
        }
        let llm_model = var("LLM_MODEL")
            .unwrap_or_else(|| crate::ai::AnyProvider::default_model(&llm_provider).to_string());

        let datasets = parse_datasets(
            &var("FORGE_DATASETS").unwrap_or_else(|| DEFAULT_DATASETS.to_string()),
        )?;

        let save_pct: f64 = parse(&var, "SAVE_THRESHOLD_PCT", 1.0)?;
        let target_pct: f64 = parse(&var, "TARGET_RETURN_PCT", 50.0)?;
        if target_pct < save_pct {
            return Err(ConfigError::Invalid {
                key: "TARGET_RETURN_PCT",
                value: target_pct.to_string(),
                reason: format!("must not be below SAVE_THRESHOLD_PCT ({save_pct})"),
            });
        }

        let worker_budget: usize = parse(&var, "WORKER_BUDGET", 4)?;
        if worker_budget == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_BUDGET",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let exec_timeout: u64 = parse(&var, "EXEC_TIMEOUT_SECS", 30)?;
        let llm_timeout: u64 = parse(&var, "LLM_TIMEOUT_SECS", 25)?;
        if exec_timeout == 0 || llm_timeout == 0 {
            return Err(ConfigError::Invalid {
                key: if exec_timeout == 0 { "EXEC_TIMEOUT_SECS" } else { "LLM_TIMEOUT_SECS" },
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if llm_timeout >= exec_timeout {
            return Err(ConfigError::Invalid {
                key: "LLM_TIMEOUT_SECS",
                value: llm_timeout.to_string(),
                reason: format!("must be shorter than EXEC_TIMEOUT_SECS ({exec_timeout})"),
            });
        }

        let cash: f64 = parse(&var, "BACKTEST_CASH", 1_000_000.0)?;
        let commission: f64 = parse(&var, "BACKTEST_COMMISSION", 0.002)?;
        if cash <= 0.0 || !(0.0..1.0).contains(&commission) {
            return Err(ConfigError::Invalid {
                key: "BACKTEST_COMMISSION",
                value: format!("cash={cash} commission={commission}"),
                reason: "cash must be positive and commission in [0, 1)".to_string(),
            });
        }

        let sandbox = SandboxConfig {
            interpreter: var("SANDBOX_INTERPRETER").unwrap_or_else(|| "python3".to_string()),
            args: var("SANDBOX_ARGS")
                .map(|a| a.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            extension: var("SANDBOX_EXTENSION")
                .map(|e| e.trim_start_matches('.').to_string())
                .unwrap_or_else(|| "py".to_string()),
            timeout: Duration::from_secs(exec_timeout),
        };

        Ok(Self {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://stratforge.db?mode=rwc".to_string()),
            llm_provider,
            llm_model,
            llm_temperature: parse(&var, "LLM_TEMPERATURE", 0.7)?,
            llm_max_tokens: parse(&var, "LLM_MAX_TOKENS", 4096)?,
            llm_timeout: Duration::from_secs(llm_timeout),
            max_debug_iterations: parse(&var, "MAX_DEBUG_ITERATIONS", 10)?,
            worker_budget,
            thresholds: Thresholds {
                save_pct,
                target_pct,
            },
            datasets,
            params: ExecutionParams { cash, commission },
            sandbox,
            data_cache_dir: match var("DATA_CACHE_DIR").as_deref() {
                Some("off") | Some("none") => None,
                Some(dir) => Some(PathBuf::from(dir)),
                None => Some(PathBuf::from("data_cache")),
            },
            csv_data_dir: PathBuf::from(var("CSV_DATA_DIR").unwrap_or_else(|| "data".to_string())),
        })
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            datasets: self.datasets.clone(),
            max_debug_iterations: self.max_debug_iterations,
            thresholds: self.thresholds,
        }
    }
}

fn parse<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Comma separated `SYMBOL:TIMEFRAME:LOOKBACKd:SOURCE` list; duplicates are
/// dropped, first occurrence keeps its position.
pub fn parse_datasets(raw: &str) -> Result<Vec<DatasetSpec>, ConfigError> {
    let mut out: Vec<DatasetSpec> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let spec = DatasetSpec::from_str(item).map_err(|reason| ConfigError::Invalid {
            key: "FORGE_DATASETS",
            value: item.to_string(),
            reason,
        })?;
        if spec.timeframe_secs().is_none() {
            return Err(ConfigError::Invalid {
                key: "FORGE_DATASETS",
                value: item.to_string(),
                reason: format!("unsupported timeframe '{}'", spec.timeframe),
            });
        }
        if !out.contains(&spec) {
            out.push(spec);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Empty("FORGE_DATASETS"));
    }
    Ok(out)
}
