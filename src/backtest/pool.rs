use crate::backtest::model::{ExecutionOutcome, ExecutionParams, GeneratedCode};
use crate::backtest::worker::StrategySandbox;
use crate::dataset::{DatasetProvider, DatasetSpec};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Operator abort flag shared by everything working for one run.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The worker budget: at most `permits` sandbox executions at once across
/// every run. Waiters are served in arrival order, so a busy run cannot
/// starve another one.
pub struct ExecutionPool {
    sandbox: Arc<dyn StrategySandbox>,
    datasets: Arc<DatasetProvider>,
    params: ExecutionParams,
    permits: Arc<Semaphore>,
    budget: usize,
}

impl ExecutionPool {
    pub fn new(
        sandbox: Arc<dyn StrategySandbox>,
        datasets: Arc<DatasetProvider>,
        params: ExecutionParams,
        budget: usize,
    ) -> Self {
        let budget = budget.max(1);
        Self {
            sandbox,
            datasets,
            params,
            permits: Arc::new(Semaphore::new(budget)),
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Fetches `spec` and runs `code` on it while holding one permit.
    ///
    /// Cancellation is honoured only before the sandbox starts; a started
    /// execution runs to completion or to its deadline.
    pub async fn run_on(
        &self,
        code: &GeneratedCode,
        spec: &DatasetSpec,
        cancel: &CancelFlag,
    ) -> ExecutionOutcome {
        if cancel.is_cancelled() {
            return ExecutionOutcome::cancelled();
        }
        let _permit = match self.permits.acquire().await {
            Ok(p) => p,
            Err(_) => return ExecutionOutcome::runtime("worker pool closed", ""),
        };
        if cancel.is_cancelled() {
            return ExecutionOutcome::cancelled();
        }

        let series = match self.datasets.get(spec).await {
            Ok(s) => s,
            Err(e) => {
                warn!("⚠ dataset {} unavailable: {}", spec, e);
                return ExecutionOutcome::fetch_error(e.to_string());
            }
        };
        if cancel.is_cancelled() {
            return ExecutionOutcome::cancelled();
        }

        let outcome = self.sandbox.execute(code, &series, &self.params).await;
        match &outcome {
            ExecutionOutcome::Success(m) => info!(
                "✓ attempt {} on {}: return {:.2}% ({} trades)",
                code.attempt, spec, m.return_pct, m.trade_count
            ),
            ExecutionOutcome::Failure(f) => info!(
                "✗ attempt {} on {}: {} {}",
                code.attempt, spec, f.category, f.message
            ),
        }
        outcome
    }
}
