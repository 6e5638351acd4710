use crate::backtest::model::{ExecutionOutcome, ExecutionParams, GeneratedCode, Metrics};
use crate::dataset::PriceSeries;
use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

const METRICS_PREFIX: &str = "METRICS:";
const TRACEBACK_LIMIT: usize = 8_000;
// Per stream; anything older is discarded while the child runs.
const OUTPUT_CAP: usize = 64 * 1024;

/// Runs one code version against one series and classifies what happened.
///
/// Implementations must never panic or hang past their deadline; every
/// problem becomes a `Failure` outcome.
#[async_trait]
pub trait StrategySandbox: Send + Sync {
    async fn execute(
        &self,
        code: &GeneratedCode,
        data: &PriceSeries,
        params: &ExecutionParams,
    ) -> ExecutionOutcome;
}

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub args: Vec<String>,
    pub extension: String,
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            args: Vec::new(),
            extension: "py".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Executes generated code in a child process inside a throwaway directory.
///
/// The child sees only `strategy.<ext>`, `data.csv` and `params.json`, a
/// cleared environment (PATH kept) and no stdin. It is killed when the
/// deadline passes.
pub struct ProcessSandbox {
    cfg: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(cfg: SandboxConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl StrategySandbox for ProcessSandbox {
    async fn execute(
        &self,
        code: &GeneratedCode,
        data: &PriceSeries,
        params: &ExecutionParams,
    ) -> ExecutionOutcome {
        let dir = match tempfile::Builder::new().prefix("stratforge-").tempdir() {
            Ok(d) => d,
            Err(e) => return ExecutionOutcome::runtime(format!("sandbox dir: {}", e), ""),
        };
        let script = format!("strategy.{}", self.cfg.extension.trim_start_matches('.'));
        let params_json = serde_json::json!({
            "cash": params.cash,
            "commission": params.commission,
        })
        .to_string();

        let csv = match data.to_csv() {
            Ok(csv) => csv,
            Err(e) => return ExecutionOutcome::runtime(format!("sandbox data: {}", e), ""),
        };
        for (name, body) in [
            (script.as_str(), code.text.as_str()),
            ("data.csv", csv.as_str()),
            ("params.json", params_json.as_str()),
        ] {
            if let Err(e) = tokio::fs::write(dir.path().join(name), body).await {
                return ExecutionOutcome::runtime(format!("sandbox write {}: {}", name, e), "");
            }
        }

        let mut cmd = Command::new(&self.cfg.interpreter);
        cmd.args(&self.cfg.args)
            .arg(&script)
            .arg("data.csv")
            .arg("params.json")
            .current_dir(dir.path())
            .env_clear()
            .env("HOME", dir.path())
            .env("STRATFORGE_DATA", dir.path().join("data.csv"))
            .env("STRATFORGE_PARAMS", dir.path().join("params.json"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        debug!(
            "sandbox: running attempt {} with {} ({} bars)",
            code.attempt,
            self.cfg.interpreter,
            data.len()
        );
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ExecutionOutcome::runtime(
                    format!("failed to start {}: {}", self.cfg.interpreter, e),
                    "",
                )
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (out, err, status) = tokio::join!(
                read_capped(stdout, OUTPUT_CAP),
                read_capped(stderr, OUTPUT_CAP),
                child.wait()
            );
            status.map(|s| (s, out, err))
        };

        // On timeout the child is dropped at return, which kills it.
        let (status, out, err) = match timeout(self.cfg.timeout, run).await {
            Err(_) => {
                warn!(
                    "⚠ sandbox: attempt {} exceeded {:?}, killed",
                    code.attempt, self.cfg.timeout
                );
                return ExecutionOutcome::timeout(format!(
                    "execution exceeded {}s deadline",
                    self.cfg.timeout.as_secs_f64()
                ));
            }
            Ok(Err(e)) => return ExecutionOutcome::runtime(format!("wait failed: {}", e), ""),
            Ok(Ok(o)) => o,
        };

        let stdout = String::from_utf8_lossy(&out);
        let stderr = String::from_utf8_lossy(&err);
        let exit = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        classify(status.success(), &exit, &stdout, &stderr)
    }
}

/// Drains `pipe` to EOF, keeping only the last `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, cap: usize) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > cap {
                    let excess = kept.len() - cap;
                    kept.drain(..excess);
                }
            }
        }
    }
    kept
}

/// Maps a finished process to an outcome.
pub fn classify(success: bool, exit: &str, stdout: &str, stderr: &str) -> ExecutionOutcome {
    if !success {
        let message = last_line(stderr)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("process exited with status {}", exit));
        let traceback = tail(stderr, TRACEBACK_LIMIT).to_string();
        return if syntax_re().is_match(stderr) {
            ExecutionOutcome::syntax(message, traceback)
        } else {
            ExecutionOutcome::runtime(message, traceback)
        };
    }

    let line = stdout
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(METRICS_PREFIX));
    match line {
        Some(json) => match parse_metrics(json.trim()) {
            Ok(m) => ExecutionOutcome::Success(m),
            Err(e) => ExecutionOutcome::invalid(
                format!("unreadable metrics line: {}", e),
                tail(stdout, TRACEBACK_LIMIT),
            ),
        },
        None => {
            let mut seen = String::from(tail(stdout, TRACEBACK_LIMIT / 2));
            if !stderr.trim().is_empty() {
                seen.push_str("\n--- stderr ---\n");
                seen.push_str(tail(stderr, TRACEBACK_LIMIT / 2));
            }
            ExecutionOutcome::invalid(
                format!("program finished without a {} line", METRICS_PREFIX),
                seen,
            )
        }
    }
}

#[derive(Deserialize)]
struct RawMetrics {
    #[serde(alias = "Return [%]")]
    return_pct: Option<f64>,
    #[serde(alias = "Buy & Hold Return [%]")]
    buy_hold_pct: Option<f64>,
    #[serde(alias = "Max. Drawdown [%]")]
    max_drawdown_pct: Option<f64>,
    #[serde(alias = "Sharpe Ratio")]
    sharpe: Option<f64>,
    #[serde(alias = "Sortino Ratio")]
    sortino: Option<f64>,
    #[serde(alias = "# Trades")]
    trade_count: Option<f64>,
}

/// Parses the JSON after `METRICS:`. Python's `NaN`/`Infinity` tokens are
/// read as missing values; `return_pct` is required.
pub fn parse_metrics(json: &str) -> Result<Metrics, String> {
    let cleaned = non_finite_re().replace_all(json, "null");
    let raw: RawMetrics = serde_json::from_str(&cleaned).map_err(|e| e.to_string())?;
    let return_pct = raw
        .return_pct
        .filter(|v| v.is_finite())
        .ok_or_else(|| "missing return_pct".to_string())?;
    let finite = |v: Option<f64>| v.filter(|x| x.is_finite()).unwrap_or(0.0);
    Ok(Metrics {
        return_pct,
        buy_hold_pct: finite(raw.buy_hold_pct),
        max_drawdown_pct: finite(raw.max_drawdown_pct),
        sharpe: finite(raw.sharpe),
        sortino: finite(raw.sortino),
        trade_count: finite(raw.trade_count).round() as i64,
    })
}

fn syntax_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(SyntaxError|IndentationError|TabError|syntax error)\b")
            .expect("static regex")
    })
}

fn non_finite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\b(?:NaN|Infinity)\b").expect("static regex"))
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().rev().map(|l| l.trim()).find(|l| !l.is_empty())
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub(crate) fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::model::FailureCategory;
    use crate::dataset::model::Bar;
    use std::time::Instant;

    fn series(n: i64) -> PriceSeries {
        PriceSeries::from_bars(
            (0..n)
                .map(|i| Bar {
                    timestamp: i * 3_600,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + i as f64,
                    volume: 10.0,
                })
                .collect(),
        )
    }

    fn category(o: &ExecutionOutcome) -> Option<FailureCategory> {
        o.as_failure().map(|f| f.category)
    }

    #[test]
    fn parses_snake_case_metrics() {
        let m = parse_metrics(
            r#"{"return_pct": 12.5, "buy_hold_pct": 3.0, "max_drawdown_pct": -4.2, "sharpe": 1.1, "sortino": 1.7, "trade_count": 9}"#,
        )
        .unwrap();
        assert_eq!(m.return_pct, 12.5);
        assert_eq!(m.trade_count, 9);
    }

    #[test]
    fn parses_backtesting_py_stat_names_with_nan() {
        let m = parse_metrics(
            r##"{"Return [%]": 5.0, "Buy & Hold Return [%]": 1.0, "Max. Drawdown [%]": -2.0, "Sharpe Ratio": NaN, "Sortino Ratio": -Infinity, "# Trades": 0, "Win Rate [%]": NaN}"##,
        )
        .unwrap();
        assert_eq!(m.return_pct, 5.0);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.sortino, 0.0);
        assert_eq!(m.trade_count, 0);
    }

    #[test]
    fn missing_return_is_rejected() {
        assert!(parse_metrics(r#"{"sharpe": 1.0}"#).is_err());
        assert!(parse_metrics(r#"{"return_pct": NaN}"#).is_err());
        assert!(parse_metrics("not json").is_err());
    }

    #[test]
    fn classify_picks_last_metrics_line() {
        let out = "METRICS: {\"return_pct\": 1.0}\nnoise\nMETRICS: {\"return_pct\": 2.0}\n";
        let o = classify(true, "0", out, "");
        assert_eq!(o.metrics().map(|m| m.return_pct), Some(2.0));
    }

    #[test]
    fn classify_syntax_vs_runtime() {
        let tb = "Traceback (most recent call last):\n  File \"strategy.py\", line 3\n    def f(:\n          ^\nSyntaxError: invalid syntax\n";
        let o = classify(false, "1", "", tb);
        assert_eq!(category(&o), Some(FailureCategory::SyntaxError));
        assert_eq!(o.as_failure().map(|f| f.message.as_str()), Some("SyntaxError: invalid syntax"));

        let o = classify(false, "1", "", "NameError: name 'rsi' is not defined\n");
        assert_eq!(category(&o), Some(FailureCategory::RuntimeError));
        assert!(o.as_failure().unwrap().traceback.contains("NameError"));
    }

    #[test]
    fn classify_success_without_metrics_is_invalid() {
        let o = classify(true, "0", "Strategy ran\n", "warning: something\n");
        assert_eq!(category(&o), Some(FailureCategory::InvalidResult));
        assert!(o.as_failure().unwrap().traceback.contains("warning: something"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(t.len() <= 3);
        assert_eq!(t, "é");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[cfg(unix)]
    fn sh_sandbox(timeout: Duration) -> ProcessSandbox {
        ProcessSandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            args: Vec::new(),
            extension: "sh".to_string(),
            timeout,
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_success_reads_data_file() {
        let sb = sh_sandbox(Duration::from_secs(10));
        let code = GeneratedCode::new(
            0,
            "rows=$(wc -l < \"$1\" | tr -d ' ')\necho \"METRICS: {\\\"return_pct\\\": $rows, \\\"trade_count\\\": 3}\"\n",
        );
        let o = sb.execute(&code, &series(5), &ExecutionParams::default()).await;
        let m = o.metrics().cloned().unwrap();
        // header + 5 bars
        assert_eq!(m.return_pct, 6.0);
        assert_eq!(m.trade_count, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runtime_error_keeps_stderr() {
        let sb = sh_sandbox(Duration::from_secs(10));
        let code = GeneratedCode::new(0, "echo \"NameError: name 'rsi' is not defined\" >&2\nexit 1\n");
        let o = sb.execute(&code, &series(3), &ExecutionParams::default()).await;
        let f = o.as_failure().cloned().unwrap();
        assert_eq!(f.category, FailureCategory::RuntimeError);
        assert_eq!(f.message, "NameError: name 'rsi' is not defined");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_timeout_is_enforced() {
        let sb = sh_sandbox(Duration::from_millis(300));
        let code = GeneratedCode::new(0, "while true; do sleep 1; done\n");
        let started = Instant::now();
        let o = sb.execute(&code, &series(3), &ExecutionParams::default()).await;
        assert_eq!(category(&o), Some(FailureCategory::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn capped_read_keeps_the_tail() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let kept = read_capped(Some(&data[..]), 1_000).await;
        assert_eq!(kept.len(), 1_000);
        assert_eq!(&kept[..], &data[data.len() - 1_000..]);
        assert!(read_capped(None::<&[u8]>, 10).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chatty_program_output_is_bounded() {
        let sb = sh_sandbox(Duration::from_secs(20));
        let code = GeneratedCode::new(
            0,
            "yes 'progress line from a chatty strategy' | head -c 4000000\nyes 'warn' | head -c 1000000 >&2\necho 'METRICS: {\"return_pct\": 4.0}'\n",
        );
        let o = sb.execute(&code, &series(3), &ExecutionParams::default()).await;
        assert_eq!(o.metrics().map(|m| m.return_pct), Some(4.0));

        let sb = sh_sandbox(Duration::from_millis(500));
        let code = GeneratedCode::new(0, "while true; do echo spam; done\n");
        let o = sb.execute(&code, &series(3), &ExecutionParams::default()).await;
        assert_eq!(category(&o), Some(FailureCategory::Timeout));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_params_are_visible() {
        let sb = sh_sandbox(Duration::from_secs(10));
        let code = GeneratedCode::new(
            0,
            "grep -q '\"cash\":1000.0' \"$2\" || exit 3\necho 'METRICS: {\"return_pct\": 1.5}'\n",
        );
        let params = ExecutionParams {
            cash: 1000.0,
            commission: 0.001,
        };
        let o = sb.execute(&code, &series(2), &params).await;
        assert_eq!(o.metrics().map(|m| m.return_pct), Some(1.5));
    }

    #[tokio::test]
    async fn missing_interpreter_is_runtime_failure() {
        let sb = ProcessSandbox::new(SandboxConfig {
            interpreter: "/nonexistent/stratforge-interp".to_string(),
            ..SandboxConfig::default()
        });
        let o = sb
            .execute(&GeneratedCode::new(0, "print(1)"), &series(2), &ExecutionParams::default())
            .await;
        assert_eq!(category(&o), Some(FailureCategory::RuntimeError));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_inputs_same_metrics() {
        let sb = sh_sandbox(Duration::from_secs(10));
        let code = GeneratedCode::new(
            0,
            "close=$(head -n 3 \"$1\" | tail -n 1 | cut -d, -f5)\necho \"METRICS: {\\\"return_pct\\\": $close}\"\n",
        );
        let data = series(10);
        let a = sb.execute(&code, &data, &ExecutionParams::default()).await;
        let b = sb.execute(&code, &data, &ExecutionParams::default()).await;
        assert!(a.is_success());
        assert_eq!(a, b);
    }
}
