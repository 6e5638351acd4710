use crate::backtest::model::{ExecutionOutcome, GeneratedCode};
use crate::backtest::pool::{CancelFlag, ExecutionPool};
use crate::dataset::DatasetSpec;
use futures::future::join_all;
use log::{error, info};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Runs one validated code version across every configured dataset.
pub struct FanoutScheduler {
    pool: Arc<ExecutionPool>,
}

impl FanoutScheduler {
    pub fn new(pool: Arc<ExecutionPool>) -> Self {
        Self { pool }
    }

    /// Returns exactly one outcome per distinct spec, whatever order the
    /// executions finish in and however many of them fail. Work beyond the
    /// pool budget queues on the pool's permits.
    pub async fn run_all(
        &self,
        code: &GeneratedCode,
        datasets: &[DatasetSpec],
        cancel: &Arc<CancelFlag>,
    ) -> BTreeMap<DatasetSpec, ExecutionOutcome> {
        let distinct: BTreeSet<DatasetSpec> = datasets.iter().cloned().collect();
        info!(
            "fan-out: attempt {} across {} datasets (budget {})",
            code.attempt,
            distinct.len(),
            self.pool.budget()
        );

        let code = Arc::new(code.clone());
        let mut tasks = Vec::with_capacity(distinct.len());
        for spec in distinct {
            let pool = self.pool.clone();
            let code = code.clone();
            let cancel = cancel.clone();
            let task_spec = spec.clone();
            let handle =
                tokio::spawn(async move { pool.run_on(&code, &task_spec, &cancel).await });
            tasks.push((spec, handle));
        }

        let (specs, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut outcomes = BTreeMap::new();
        for (spec, res) in specs.into_iter().zip(joined) {
            let outcome = match res {
                Ok(o) => o,
                Err(e) => {
                    error!("fan-out task for {} died: {}", spec, e);
                    ExecutionOutcome::runtime(format!("execution task aborted: {}", e), "")
                }
            };
            outcomes.insert(spec, outcome);
        }

        let ok = outcomes.values().filter(|o| o.is_success()).count();
        info!(
            "fan-out: attempt {} finished, {}/{} datasets succeeded",
            code.attempt,
            ok,
            outcomes.len()
        );
        outcomes
    }
}
