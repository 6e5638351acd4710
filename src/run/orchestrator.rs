use crate::app_state::AppEvent;
use crate::backtest::model::{ExecutionOutcome, Failure, FailureCategory, GeneratedCode};
use crate::backtest::pool::{CancelFlag, ExecutionPool};
use crate::backtest::service::FanoutScheduler;
use crate::dataset::DatasetSpec;
use crate::generate::{CodeGenerator, PromptBuilder};
use crate::run::aggregate::{outcomes_json, ResultAggregator, RunResult, Thresholds};
use crate::run::repair::{AttemptObserver, AttemptRecord, RepairEnd, RepairLoop};
use crate::run::{new_run_id, RunStatus};
use crate::storage::entity::{code_version, failed_run, run, strategy_result};
use crate::storage::repository::{
    parse_code_reference, CodeVersionRepository, FailedRunRepository, ResultRepository,
    RunRepository, RunSummaryUpdate,
};
use async_trait::async_trait;
use log::{error, info, warn};
use sea_orm::{DatabaseConnection, DbErr};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything a run needs to know, fixed at construction.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub datasets: Vec<DatasetSpec>,
    pub max_debug_iterations: u32,
    pub thresholds: Thresholds,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Attempts actually made, generation failures included.
    pub attempts: u32,
    pub result: Option<RunResult>,
    /// `failed_runs.reason`, when a marker was written.
    pub marker: Option<String>,
}

impl RunReport {
    fn error(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Error,
            attempts: 0,
            result: None,
            marker: Some("ERROR".to_string()),
        }
    }
}

pub struct RunHandle {
    pub run_id: String,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub async fn wait(self) -> RunReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!("run {} supervisor died: {}", self.run_id, e);
                RunReport::error(&self.run_id)
            }
        }
    }
}

/// What `show <run_id>` displays.
#[derive(Clone, Debug)]
pub struct RunDetail {
    pub run: run::Model,
    pub accepted_code: Option<code_version::Model>,
    pub versions: usize,
    pub results: Vec<strategy_result::Model>,
    pub marker: Option<failed_run::Model>,
}

struct RunContext {
    db: Arc<DatabaseConnection>,
    repair: RepairLoop,
    fanout: FanoutScheduler,
    aggregator: ResultAggregator,
    config: RunConfig,
    events: Option<mpsc::UnboundedSender<AppEvent>>,
}

/// Drives ideas end to end, each on its own task.
///
/// Runs share only the execution pool (and through it the dataset cache).
pub struct RunOrchestrator {
    ctx: Arc<RunContext>,
    active: Arc<Mutex<HashMap<String, Arc<CancelFlag>>>>,
}

impl RunOrchestrator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        generator: Arc<dyn CodeGenerator>,
        pool: Arc<ExecutionPool>,
        prompts: PromptBuilder,
        config: RunConfig,
        events: Option<mpsc::UnboundedSender<AppEvent>>,
    ) -> Self {
        let repair = RepairLoop::new(
            generator,
            pool.clone(),
            Arc::new(prompts),
            config.max_debug_iterations,
        );
        let ctx = RunContext {
            aggregator: ResultAggregator::new(db.clone(), config.thresholds),
            fanout: FanoutScheduler::new(pool),
            repair,
            db,
            config,
            events,
        };
        Self {
            ctx: Arc::new(ctx),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records the run and starts it in the background.
    pub async fn submit(&self, idea: &str) -> anyhow::Result<RunHandle> {
        let idea = idea.trim().to_string();
        if idea.is_empty() {
            anyhow::bail!("idea is empty");
        }
        let run_id = self.create_run(&idea).await?;

        let cancel = Arc::new(CancelFlag::default());
        if let Ok(mut active) = self.active.lock() {
            active.insert(run_id.clone(), cancel.clone());
        }

        let ctx = self.ctx.clone();
        let active = self.active.clone();
        let id = run_id.clone();
        let task = tokio::spawn(async move {
            let inner = {
                let (ctx, id, idea, cancel) = (ctx.clone(), id.clone(), idea.clone(), cancel);
                tokio::spawn(async move { ctx.drive(&id, &idea, &cancel).await })
            };
            let report = match inner.await {
                Ok(report) => report,
                Err(e) => {
                    error!("❌ run {} task aborted: {}", id, e);
                    ctx.fail_run(&id, &idea, 0, &format!("run task aborted: {}", e))
                        .await;
                    RunReport::error(&id)
                }
            };
            if let Ok(mut active) = active.lock() {
                active.remove(&id);
            }
            report
        });

        Ok(RunHandle { run_id, task })
    }

    /// Submits every non-blank idea; one failed submission does not stop the rest.
    pub async fn submit_batch<I, S>(&self, ideas: I) -> Vec<anyhow::Result<RunHandle>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut handles = Vec::new();
        for idea in ideas {
            let idea = idea.as_ref().trim();
            if idea.is_empty() {
                continue;
            }
            handles.push(self.submit(idea).await);
        }
        handles
    }

    /// Asks a live run to stop. Executions already inside the sandbox finish.
    pub fn cancel(&self, run_id: &str) -> bool {
        let flag = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(run_id).cloned());
        match flag {
            Some(flag) => {
                flag.cancel();
                info!("⏹ run {} cancel requested", run_id);
                true
            }
            None => false,
        }
    }

    /// Cancels every live run, e.g. on shutdown. Each still writes its marker.
    pub fn cancel_all(&self) -> Vec<String> {
        let ids = self.active_runs();
        ids.iter().filter(|id| self.cancel(id)).cloned().collect()
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .map(|active| active.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn list_runs(&self, limit: u64) -> Result<Vec<run::Model>, DbErr> {
        RunRepository::list_recent(self.ctx.db.as_ref(), limit).await
    }

    pub async fn run_detail(&self, run_id: &str) -> Result<Option<RunDetail>, DbErr> {
        let db = self.ctx.db.as_ref();
        let Some(run) = RunRepository::find(db, run_id).await? else {
            return Ok(None);
        };
        let versions = CodeVersionRepository::list_for_run(db, run_id).await?;
        let results = ResultRepository::list_for_run(db, run_id).await?;
        // Rows carry their own code reference; prefer it over the run row.
        let accepted = results
            .first()
            .and_then(|r| parse_code_reference(&r.code_reference))
            .map(|(_, attempt)| attempt)
            .or(run.accepted_attempt);
        let accepted_code = match accepted {
            Some(a) => CodeVersionRepository::find_attempt(db, run_id, a).await?,
            None => None,
        };
        let marker = FailedRunRepository::find_for_run(db, run_id).await?;
        Ok(Some(RunDetail {
            run,
            accepted_code,
            versions: versions.len(),
            results,
            marker,
        }))
    }

    /// Call once at startup: runs a previous process left mid-flight can
    /// never finish, so they are closed with an `INTERRUPTED` marker.
    pub async fn recover(&self) -> Result<usize, DbErr> {
        let db = self.ctx.db.as_ref();
        let active: Vec<&str> = RunStatus::ACTIVE.iter().map(|s| s.as_str()).collect();
        let stale = RunRepository::find_in_status(db, &active).await?;
        for r in &stale {
            RunRepository::mark_error(
                db,
                &r.run_id,
                RunStatus::Error.as_str(),
                "interrupted by process restart",
            )
            .await?;
            FailedRunRepository::insert(
                db,
                &r.run_id,
                &r.idea,
                "INTERRUPTED",
                r.attempts,
                None,
                Some(format!("left in {} by a previous process", r.status)),
            )
            .await?;
        }
        if !stale.is_empty() {
            warn!("⚠ recovered {} interrupted runs", stale.len());
        }
        Ok(stale.len())
    }

    async fn create_run(&self, idea: &str) -> anyhow::Result<String> {
        let mut tries = 0;
        loop {
            let run_id = new_run_id(idea);
            match RunRepository::create(
                self.ctx.db.as_ref(),
                &run_id,
                idea,
                RunStatus::Generating.as_str(),
            )
            .await
            {
                Ok(_) => return Ok(run_id),
                // Same idea, same second, same random suffix.
                Err(e) if tries < 2 => {
                    warn!("run id {} rejected ({}), retrying", run_id, e);
                    tries += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl RunContext {
    fn emit(&self, evt: AppEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(evt);
        }
    }

    async fn drive(&self, run_id: &str, idea: &str, cancel: &Arc<CancelFlag>) -> RunReport {
        info!("▶ run {} started: {}", run_id, idea);
        self.emit(AppEvent::Message(format!("▶ {} started", run_id)));

        let observer = RunObserver { ctx: self, run_id };
        let repair = self
            .repair
            .run(idea, &self.config.datasets, cancel, &observer)
            .await;
        let attempts = repair.history.len() as u32;
        info!(
            "run {} left the repair loop after {} repairs",
            run_id,
            repair.repairs()
        );

        let report = match repair.end {
            RepairEnd::Cancelled { attempt } => {
                let last = repair
                    .history
                    .iter()
                    .rev()
                    .filter_map(|r| r.outcome.as_failure())
                    .find(|f| f.category.is_code_defect())
                    .cloned();
                self.close_with_marker(
                    run_id,
                    idea,
                    RunStatus::Cancelled,
                    attempts,
                    attempt,
                    last.as_ref(),
                    "cancelled by operator",
                    None,
                )
                .await
            }
            RepairEnd::Exhausted { attempt, failure } => {
                self.close_with_marker(
                    run_id,
                    idea,
                    RunStatus::Exhausted,
                    attempts,
                    attempt,
                    Some(&failure),
                    &failure.message,
                    None,
                )
                .await
            }
            RepairEnd::Succeeded { code, smoke, .. } => {
                self.fan_out_and_aggregate(run_id, idea, attempts, code, smoke, cancel)
                    .await
            }
        };

        match report {
            Ok(report) => {
                let msg = match &report.result {
                    Some(r) => format!(
                        "{} {}: {}/{} datasets ok, best {}, {} rows saved",
                        report.run_id,
                        report.status,
                        r.success_count,
                        r.outcomes.len(),
                        r.best_return_pct
                            .map(|b| format!("{:.2}%", b))
                            .unwrap_or_else(|| "-".to_string()),
                        r.rows_saved
                    ),
                    None => format!(
                        "{} {} after {} attempts",
                        report.run_id, report.status, report.attempts
                    ),
                };
                info!("■ run {}", msg);
                self.emit(AppEvent::Message(format!("■ {}", msg)));
                report
            }
            Err(e) => {
                error!("❌ run {} bookkeeping failed: {}", run_id, e);
                self.fail_run(run_id, idea, attempts as i32, &e.to_string())
                    .await;
                let mut report = RunReport::error(run_id);
                report.attempts = attempts;
                report
            }
        }
    }

    async fn fan_out_and_aggregate(
        &self,
        run_id: &str,
        idea: &str,
        attempts: u32,
        code: GeneratedCode,
        smoke: DatasetSpec,
        cancel: &Arc<CancelFlag>,
    ) -> Result<RunReport, DbErr> {
        let db = self.db.as_ref();
        RunRepository::mark_status(db, run_id, RunStatus::Fanout.as_str(), attempts as i32).await?;

        let outcomes = self
            .fanout
            .run_all(&code, &self.config.datasets, cancel)
            .await;

        if cancel.is_cancelled() {
            let mut report = self
                .close_with_marker(
                    run_id,
                    idea,
                    RunStatus::Cancelled,
                    attempts,
                    code.attempt,
                    None,
                    "cancelled during fan-out",
                    Some(&outcomes),
                )
                .await?;
            report.result = None;
            return Ok(report);
        }

        let result = self.aggregator.aggregate(run_id, &code, outcomes).await;
        let thresholds = self.aggregator.thresholds();

        let (status, marker, message) = if result.savable && result.rows_saved == 0 {
            (
                RunStatus::Error,
                Some("ERROR"),
                Some(format!("could not persist {} result rows", result.row_errors)),
            )
        } else if result.savable {
            (RunStatus::Saved, None, None)
        } else if result.success_count > 0 {
            (
                RunStatus::BelowThreshold,
                Some("BELOW_THRESHOLD"),
                Some(format!(
                    "below threshold: best return {:.2}% did not exceed {:.2}%",
                    result.best_return_pct.unwrap_or_default(),
                    thresholds.save_pct
                )),
            )
        } else {
            (
                RunStatus::NoSuccess,
                Some("NO_SUCCESS"),
                Some("no dataset produced metrics".to_string()),
            )
        };

        if let (Some(reason), Some(message)) = (marker, message.as_ref()) {
            let first_failure = result.outcomes.values().find_map(|o| o.as_failure());
            let (category, detail) = match (status, first_failure) {
                (RunStatus::NoSuccess, Some(f)) => (
                    Some(f.category.as_str().to_string()),
                    format!("{}: {}", message, f.message),
                ),
                _ => (None, message.clone()),
            };
            FailedRunRepository::insert(
                db,
                run_id,
                idea,
                reason,
                code.attempt as i32,
                category,
                Some(detail),
            )
            .await?;
        }

        RunRepository::finish(
            db,
            run_id,
            RunSummaryUpdate {
                status: status.as_str().to_string(),
                attempts: attempts as i32,
                accepted_attempt: Some(code.attempt as i32),
                smoke_dataset: Some(smoke.to_string()),
                success_count: result.success_count as i32,
                best_return_pct: result.best_return_pct,
                median_return_pct: result.median_return_pct,
                target_met: result.target_met,
                rows_saved: result.rows_saved as i32,
                outcomes_json: Some(outcomes_json(&result.outcomes)),
                last_error: message,
            },
        )
        .await?;

        Ok(RunReport {
            run_id: run_id.to_string(),
            status,
            attempts,
            marker: marker.map(str::to_string),
            result: Some(result),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn close_with_marker(
        &self,
        run_id: &str,
        idea: &str,
        status: RunStatus,
        attempts: u32,
        at_attempt: u32,
        last: Option<&Failure>,
        message: &str,
        outcomes: Option<&BTreeMap<DatasetSpec, ExecutionOutcome>>,
    ) -> Result<RunReport, DbErr> {
        let db = self.db.as_ref();
        FailedRunRepository::insert(
            db,
            run_id,
            idea,
            status.as_str(),
            at_attempt as i32,
            last.map(|f| f.category.as_str().to_string()),
            Some(last.map(|f| f.message.clone()).unwrap_or_else(|| message.to_string())),
        )
        .await?;
        RunRepository::finish(
            db,
            run_id,
            RunSummaryUpdate {
                status: status.as_str().to_string(),
                attempts: attempts as i32,
                outcomes_json: outcomes.map(outcomes_json),
                last_error: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok(RunReport {
            run_id: run_id.to_string(),
            status,
            attempts,
            result: None,
            marker: Some(status.as_str().to_string()),
        })
    }

    /// Last resort: nothing here may fail the caller.
    async fn fail_run(&self, run_id: &str, idea: &str, attempts: i32, message: &str) {
        let db = self.db.as_ref();
        if let Err(e) =
            RunRepository::mark_error(db, run_id, RunStatus::Error.as_str(), message).await
        {
            error!("❌ could not mark run {} as ERROR: {}", run_id, e);
        }
        if let Err(e) = FailedRunRepository::insert(
            db,
            run_id,
            idea,
            "ERROR",
            attempts,
            None,
            Some(message.to_string()),
        )
        .await
        {
            error!("❌ could not write failure marker for {}: {}", run_id, e);
        }
        self.emit(AppEvent::Error(format!("{} ERROR: {}", run_id, message)));
    }
}

/// Writes each attempt to `code_versions` as soon as its outcome is known.
struct RunObserver<'a> {
    ctx: &'a RunContext,
    run_id: &'a str,
}

#[async_trait]
impl<'a> AttemptObserver for RunObserver<'a> {
    async fn on_attempt(&self, record: &AttemptRecord) {
        let db = self.ctx.db.as_ref();
        let (outcome, message, metrics_json) = match &record.outcome {
            ExecutionOutcome::Success(m) => {
                ("SUCCESS".to_string(), None, serde_json::to_string(m).ok())
            }
            ExecutionOutcome::Failure(f) => {
                (f.category.as_str().to_string(), Some(f.message.clone()), None)
            }
        };
        if let Err(e) = CodeVersionRepository::insert(
            db,
            self.run_id,
            record.attempt as i32,
            record.code.as_ref().map(|c| c.text.clone()),
            record.smoke.as_ref().map(|s| s.to_string()),
            &outcome,
            message.clone(),
            metrics_json,
        )
        .await
        {
            error!(
                "❌ could not store attempt {} of {}: {}",
                record.attempt, self.run_id, e
            );
        }

        if let Some(f) = record.outcome.as_failure() {
            if f.category.is_code_defect() || f.category == FailureCategory::GenerationError {
                if let Err(e) = RunRepository::mark_status(
                    db,
                    self.run_id,
                    RunStatus::Repairing.as_str(),
                    record.attempt as i32 + 1,
                )
                .await
                {
                    error!("❌ could not update run {}: {}", self.run_id, e);
                }
            }
            self.ctx.emit(AppEvent::Log(format!(
                "{} attempt {}: {} {}",
                self.run_id,
                record.attempt,
                outcome,
                message.unwrap_or_default()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::model::ExecutionParams;
    use crate::dataset::DatasetProvider;
    use crate::storage::connection::establish_connection;
    use crate::testing::{ScriptedGenerator, ScriptedSandbox, StaticSource};
    use std::time::Duration;

    fn specs(symbols: &[&str]) -> Vec<DatasetSpec> {
        symbols
            .iter()
            .map(|s| DatasetSpec::new(s, "1h", 30, "mem"))
            .collect()
    }

    async fn orchestrator(
        generator: ScriptedGenerator,
        sandbox: ScriptedSandbox,
        source: StaticSource,
        datasets: &[&str],
    ) -> (RunOrchestrator, Arc<DatabaseConnection>) {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let provider = Arc::new(DatasetProvider::new(None).with_source("mem", Arc::new(source)));
        let pool = Arc::new(ExecutionPool::new(
            Arc::new(sandbox),
            provider,
            ExecutionParams::default(),
            2,
        ));
        let orch = RunOrchestrator::new(
            db.clone(),
            Arc::new(generator),
            pool,
            PromptBuilder::new("Python 3"),
            RunConfig {
                datasets: specs(datasets),
                max_debug_iterations: 10,
                thresholds: Thresholds::default(),
            },
            None,
        );
        (orch, db)
    }

    #[tokio::test]
    async fn rsi_idea_saves_two_of_three() {
        let (orch, db) = orchestrator(
            ScriptedGenerator::code(&["rsi strategy"]),
            ScriptedSandbox::by_symbol(&[("AAA", 5.0), ("BBB", 12.0)]),
            StaticSource::flat(&["AAA", "BBB"], 24).missing("CCC"),
            &["AAA", "BBB", "CCC"],
        )
        .await;

        let report = orch
            .submit("buy when RSI<30, sell when RSI>70")
            .await
            .unwrap()
            .wait()
            .await;

        assert_eq!(report.status, RunStatus::Saved);
        assert_eq!(report.attempts, 1);
        assert!(report.marker.is_none());
        let result = report.result.unwrap();
        assert!(result.savable);
        assert_eq!(result.rows_saved, 2);
        assert_eq!(result.success_count, 2);
        assert_eq!(
            result.outcomes[&DatasetSpec::new("CCC", "1h", 30, "mem")]
                .as_failure()
                .map(|f| f.category),
            Some(FailureCategory::DatasetFetchError)
        );

        let detail = orch.run_detail(&report.run_id).await.unwrap().unwrap();
        assert_eq!(detail.run.status, "SAVED");
        assert_eq!(detail.results.len(), 2);
        assert_eq!(detail.versions, 1);
        assert_eq!(
            detail.accepted_code.and_then(|c| c.code).as_deref(),
            Some("rsi strategy")
        );
        assert!(detail.marker.is_none());
        assert_eq!(
            ResultRepository::list_for_run(db.as_ref(), &report.run_id)
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(orch.active_runs().is_empty());
    }

    #[tokio::test]
    async fn undefined_variable_repaired_on_attempt_one() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["print(BROKEN)", "fixed strategy"]),
            ScriptedSandbox::uniform(4.0),
            StaticSource::flat(&["AAA", "BBB"], 24),
            &["AAA", "BBB"],
        )
        .await;

        let report = orch.submit("rsi idea").await.unwrap().wait().await;
        assert_eq!(report.status, RunStatus::Saved);
        assert_eq!(report.attempts, 2);

        let detail = orch.run_detail(&report.run_id).await.unwrap().unwrap();
        assert_eq!(detail.versions, 2);
        assert_eq!(detail.run.accepted_attempt, Some(1));
        for row in &detail.results {
            assert_eq!(row.attempt_number, 1);
            let (run_id, attempt) = parse_code_reference(&row.code_reference).unwrap();
            assert_eq!((run_id, attempt), (report.run_id.as_str(), 1));
        }
        assert_eq!(
            detail.accepted_code.and_then(|c| c.code).as_deref(),
            Some("fixed strategy")
        );
    }

    #[tokio::test]
    async fn unbounded_loop_exhausts_with_timeout() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["while True: LOOP"]),
            ScriptedSandbox::uniform(4.0),
            StaticSource::flat(&["AAA"], 24),
            &["AAA"],
        )
        .await;

        let report = orch.submit("spin forever").await.unwrap().wait().await;
        assert_eq!(report.status, RunStatus::Exhausted);
        assert_eq!(report.attempts, 11);

        let detail = orch.run_detail(&report.run_id).await.unwrap().unwrap();
        let marker = detail.marker.unwrap();
        assert_eq!(marker.reason, "EXHAUSTED");
        assert_eq!(marker.exhausted_at_attempt, 10);
        assert_eq!(marker.last_error_category.as_deref(), Some("Timeout"));
        assert!(detail.results.is_empty());
        assert_eq!(detail.versions, 11);
    }

    #[tokio::test]
    async fn below_threshold_gets_its_own_marker() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["meh strategy"]),
            ScriptedSandbox::uniform(0.5),
            StaticSource::flat(&["AAA", "BBB"], 24),
            &["AAA", "BBB"],
        )
        .await;

        let report = orch.submit("weak idea").await.unwrap().wait().await;
        assert_eq!(report.status, RunStatus::BelowThreshold);
        assert_eq!(report.marker.as_deref(), Some("BELOW_THRESHOLD"));
        let result = report.result.unwrap();
        assert!(!result.savable);
        assert_eq!(result.rows_saved, 0);

        let detail = orch.run_detail(&report.run_id).await.unwrap().unwrap();
        let marker = detail.marker.unwrap();
        assert_eq!(marker.reason, "BELOW_THRESHOLD");
        assert!(marker.last_error_category.is_none());
        assert!(marker
            .last_error_message
            .unwrap_or_default()
            .contains("below threshold"));
        assert!(detail.results.is_empty());
    }

    #[tokio::test]
    async fn cancel_stops_a_live_run() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["BROKEN"]).with_delay(Duration::from_millis(50)),
            ScriptedSandbox::uniform(4.0),
            StaticSource::flat(&["AAA"], 24),
            &["AAA"],
        )
        .await;

        let handle = orch.submit("slow idea").await.unwrap();
        assert!(orch.cancel(&handle.run_id));
        let report = handle.wait().await;
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.attempts <= 1);
        assert!(!orch.cancel(&report.run_id));

        let detail = orch.run_detail(&report.run_id).await.unwrap().unwrap();
        assert_eq!(detail.run.status, "CANCELLED");
        assert_eq!(detail.marker.unwrap().reason, "CANCELLED");
    }

    #[tokio::test]
    async fn shutdown_cancel_marks_every_live_run() {
        let (orch, db) = orchestrator(
            ScriptedGenerator::code(&["BROKEN"]).with_delay(Duration::from_millis(50)),
            ScriptedSandbox::uniform(4.0),
            StaticSource::flat(&["AAA"], 24),
            &["AAA"],
        )
        .await;

        let handles: Vec<RunHandle> = orch
            .submit_batch(["first idea", "second idea"])
            .await
            .into_iter()
            .map(|h| h.unwrap())
            .collect();
        assert_eq!(orch.cancel_all().len(), 2);
        for handle in handles {
            let report = handle.wait().await;
            assert_eq!(report.status, RunStatus::Cancelled);
            let marker = FailedRunRepository::find_for_run(db.as_ref(), &report.run_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(marker.reason, "CANCELLED");
        }
        assert!(orch.active_runs().is_empty());
        assert!(orch.cancel_all().is_empty());
    }

    #[tokio::test]
    async fn batch_runs_concurrently_and_independently() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["good strategy"]),
            ScriptedSandbox::uniform(3.0),
            StaticSource::flat(&["AAA", "BBB", "CCC"], 24),
            &["AAA", "BBB", "CCC"],
        )
        .await;

        let handles = orch
            .submit_batch(["idea one", "", "idea two", "idea three"])
            .await;
        assert_eq!(handles.len(), 3);
        let mut ids = Vec::new();
        for h in handles {
            let report = h.unwrap().wait().await;
            assert_eq!(report.status, RunStatus::Saved);
            assert_eq!(report.result.unwrap().rows_saved, 3);
            ids.push(report.run_id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(orch.list_runs(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_idea_is_rejected() {
        let (orch, _db) = orchestrator(
            ScriptedGenerator::code(&["x"]),
            ScriptedSandbox::uniform(3.0),
            StaticSource::flat(&["AAA"], 24),
            &["AAA"],
        )
        .await;
        assert!(orch.submit("   ").await.is_err());
        assert!(orch.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_closes_runs_from_a_dead_process() {
        let (orch, db) = orchestrator(
            ScriptedGenerator::code(&["x"]),
            ScriptedSandbox::uniform(3.0),
            StaticSource::flat(&["AAA"], 24),
            &["AAA"],
        )
        .await;
        RunRepository::create(db.as_ref(), "old_run", "half done", "FANOUT")
            .await
            .unwrap();
        RunRepository::create(db.as_ref(), "done_run", "finished", "SAVED")
            .await
            .unwrap();

        assert_eq!(orch.recover().await.unwrap(), 1);
        let detail = orch.run_detail("old_run").await.unwrap().unwrap();
        assert_eq!(detail.run.status, "ERROR");
        assert_eq!(detail.marker.unwrap().reason, "INTERRUPTED");
        assert_eq!(
            orch.run_detail("done_run").await.unwrap().unwrap().run.status,
            "SAVED"
        );
        assert_eq!(orch.recover().await.unwrap(), 0);
    }
}
