//! Deterministic stand-ins for the network and the interpreter.

use crate::backtest::model::{ExecutionOutcome, ExecutionParams, FailureCategory, GeneratedCode, Metrics};
use crate::backtest::worker::StrategySandbox;
use crate::dataset::model::{Bar, DatasetError};
use crate::dataset::{DatasetSpec, PriceSeries, PriceSource};
use crate::generate::client::{CodePrompt, GenerationError};
use crate::generate::CodeGenerator;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Symbols of up to six ASCII bytes packed into an integer that survives
/// the trip through an f64 volume column.
fn encode_symbol(symbol: &str) -> f64 {
    symbol
        .bytes()
        .take(6)
        .fold(0u64, |acc, b| acc * 256 + b as u64) as f64
}

fn decode_symbol(v: f64) -> String {
    let mut n = v as u64;
    let mut bytes = Vec::new();
    while n > 0 {
        bytes.push((n % 256) as u8);
        n /= 256;
    }
    bytes.reverse();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn symbol_of(series: &PriceSeries) -> String {
    series
        .bars
        .first()
        .map(|b| decode_symbol(b.volume))
        .unwrap_or_default()
}

/// In-memory price source: every symbol gets `bars` flat hourly bars.
pub struct StaticSource {
    symbols: HashSet<String>,
    missing: HashSet<String>,
    bars: usize,
    fetches: Arc<AtomicUsize>,
}

impl StaticSource {
    pub fn flat(symbols: &[&str], bars: usize) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            missing: HashSet::new(),
            bars,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `symbol` fails to fetch.
    pub fn missing(mut self, symbol: &str) -> Self {
        self.symbols.remove(symbol);
        self.missing.insert(symbol.to_string());
        self
    }

    pub fn fetches(&self) -> Arc<AtomicUsize> {
        self.fetches.clone()
    }
}

#[async_trait]
impl PriceSource for StaticSource {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<PriceSeries, DatasetError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.missing.contains(&spec.symbol) || !self.symbols.contains(&spec.symbol) {
            return Err(DatasetError::Http(format!("404 for {}", spec.symbol)));
        }
        let tag = encode_symbol(&spec.symbol);
        let bars = (0..self.bars)
            .map(|i| Bar {
                timestamp: 1_700_000_000 + i as i64 * 3_600,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: tag,
            })
            .collect();
        Ok(PriceSeries::from_bars(bars))
    }
}

pub fn metrics(return_pct: f64) -> Metrics {
    Metrics {
        return_pct,
        buy_hold_pct: 1.5,
        max_drawdown_pct: -4.0,
        sharpe: 0.8,
        sortino: 1.1,
        trade_count: 7,
    }
}

/// Fake interpreter. Code text decides defects, the dataset symbol decides
/// the return:
/// `SYNTAX` / `BROKEN` / `LOOP` / `NOMETRICS` in the code yield
/// `SyntaxError` / `RuntimeError` / `Timeout` / `InvalidResult`.
pub struct ScriptedSandbox {
    returns: HashMap<String, f64>,
    failures: HashMap<String, FailureCategory>,
    default_return: Option<f64>,
    calls: Arc<Mutex<Vec<(u32, String)>>>,
}

impl ScriptedSandbox {
    pub fn by_symbol(returns: &[(&str, f64)]) -> Self {
        Self {
            returns: returns.iter().map(|(s, r)| (s.to_string(), *r)).collect(),
            failures: HashMap::new(),
            default_return: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every dataset returns `return_pct`.
    pub fn uniform(return_pct: f64) -> Self {
        let mut s = Self::by_symbol(&[]);
        s.default_return = Some(return_pct);
        s
    }

    pub fn with_failure(mut self, symbol: &str, category: FailureCategory) -> Self {
        self.failures.insert(symbol.to_string(), category);
        self
    }

    /// (attempt, symbol) per execution, in call order.
    pub fn calls(&self) -> Arc<Mutex<Vec<(u32, String)>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl StrategySandbox for ScriptedSandbox {
    async fn execute(
        &self,
        code: &GeneratedCode,
        data: &PriceSeries,
        _params: &ExecutionParams,
    ) -> ExecutionOutcome {
        let symbol = symbol_of(data);
        self.calls
            .lock()
            .unwrap()
            .push((code.attempt, symbol.clone()));

        if code.text.contains("SYNTAX") {
            return ExecutionOutcome::syntax(
                "SyntaxError: invalid syntax",
                "  File \"strategy.py\", line 3\nSyntaxError: invalid syntax",
            );
        }
        if code.text.contains("BROKEN") {
            return ExecutionOutcome::runtime(
                "NameError: name 'rsi' is not defined",
                "Traceback (most recent call last):\nNameError: name 'rsi' is not defined",
            );
        }
        if code.text.contains("LOOP") {
            return ExecutionOutcome::timeout("execution exceeded 30s");
        }
        if code.text.contains("NOMETRICS") {
            return ExecutionOutcome::invalid("no METRICS line on stdout", "");
        }
        if let Some(cat) = self.failures.get(&symbol) {
            return ExecutionOutcome::failure(*cat, format!("scripted failure on {symbol}"), "");
        }
        match self.returns.get(&symbol).copied().or(self.default_return) {
            Some(r) => ExecutionOutcome::Success(metrics(r)),
            None => ExecutionOutcome::runtime(format!("no script for {symbol}"), ""),
        }
    }
}

/// Fake LLM: hands out queued replies in order, repeating the last one.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    last: Mutex<Option<Result<String, GenerationError>>>,
    prompts: Arc<Mutex<Vec<CodePrompt>>>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            prompts: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    pub fn code(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn prompts(&self) -> Arc<Mutex<Vec<CodePrompt>>> {
        self.prompts.clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &CodePrompt) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        last.clone()
            .unwrap_or_else(|| Err(GenerationError::Unavailable("no scripted reply".to_string())))
    }
}

#[test]
fn symbols_survive_the_volume_column() {
    assert_eq!(decode_symbol(encode_symbol("BTC")), "BTC");
    assert_eq!(decode_symbol(encode_symbol("ETHUSD")), "ETHUSD");
}
