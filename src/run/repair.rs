use crate::backtest::model::{ExecutionOutcome, Failure, FailureCategory, GeneratedCode, Metrics};
use crate::backtest::pool::{CancelFlag, ExecutionPool};
use crate::dataset::DatasetSpec;
use crate::generate::{CodeGenerator, PromptBuilder};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

/// One generation-and-validation cycle.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// `None` when generation itself failed.
    pub code: Option<GeneratedCode>,
    pub smoke: Option<DatasetSpec>,
    pub outcome: ExecutionOutcome,
}

#[derive(Clone, Debug)]
pub enum RepairEnd {
    Succeeded {
        code: GeneratedCode,
        smoke: DatasetSpec,
        metrics: Metrics,
    },
    Exhausted {
        attempt: u32,
        failure: Failure,
    },
    Cancelled {
        attempt: u32,
    },
}

#[derive(Clone, Debug)]
pub struct RepairReport {
    pub end: RepairEnd,
    pub history: Vec<AttemptRecord>,
}

impl RepairReport {
    /// Number of repair cycles run after attempt 0.
    pub fn repairs(&self) -> usize {
        self.history.len().saturating_sub(1)
    }
}

/// Hook called after every attempt, before the next one starts.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn on_attempt(&self, record: &AttemptRecord);
}

/// Bounded generate → smoke-test → repair cycle for one idea.
///
/// Attempts run strictly one after another, numbered from 0 up to
/// `max_debug_iterations` inclusive. Code is validated on a single smoke
/// dataset: the first configured dataset that can actually be fetched.
pub struct RepairLoop {
    generator: Arc<dyn CodeGenerator>,
    pool: Arc<ExecutionPool>,
    prompts: Arc<PromptBuilder>,
    max_debug_iterations: u32,
}

impl RepairLoop {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        pool: Arc<ExecutionPool>,
        prompts: Arc<PromptBuilder>,
        max_debug_iterations: u32,
    ) -> Self {
        Self {
            generator,
            pool,
            prompts,
            max_debug_iterations,
        }
    }

    pub async fn run(
        &self,
        idea: &str,
        datasets: &[DatasetSpec],
        cancel: &CancelFlag,
        observer: &dyn AttemptObserver,
    ) -> RepairReport {
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut last_defect: Option<(GeneratedCode, Failure)> = None;
        let mut smoke_idx = 0usize;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return RepairReport {
                    end: RepairEnd::Cancelled { attempt },
                    history,
                };
            }

            let prompt = self
                .prompts
                .retry(idea, last_defect.as_ref().map(|(c, f)| (c, f)));
            let code = match self.generator.generate(&prompt).await {
                Ok(text) => GeneratedCode::new(attempt, text),
                Err(e) => {
                    warn!("✗ attempt {} generation failed: {}", attempt, e);
                    let record = AttemptRecord {
                        attempt,
                        code: None,
                        smoke: None,
                        outcome: ExecutionOutcome::failure(
                            FailureCategory::GenerationError,
                            e.to_string(),
                            "",
                        ),
                    };
                    observer.on_attempt(&record).await;
                    history.push(record);
                    if attempt < self.max_debug_iterations {
                        attempt += 1;
                        continue;
                    }
                    return self.exhausted(attempt, history);
                }
            };

            if cancel.is_cancelled() {
                let record = AttemptRecord {
                    attempt,
                    code: Some(code),
                    smoke: None,
                    outcome: ExecutionOutcome::cancelled(),
                };
                observer.on_attempt(&record).await;
                history.push(record);
                return RepairReport {
                    end: RepairEnd::Cancelled { attempt },
                    history,
                };
            }

            // Walk forward through the datasets until one can be fetched;
            // once found it stays the smoke dataset for later attempts.
            let mut smoke = None;
            let mut outcome = ExecutionOutcome::fetch_error("no datasets configured");
            while smoke_idx < datasets.len() {
                let spec = &datasets[smoke_idx];
                outcome = self.pool.run_on(&code, spec, cancel).await;
                match outcome.as_failure().map(|f| f.category) {
                    Some(FailureCategory::DatasetFetchError) => {
                        warn!("⚠ smoke dataset {} unavailable, trying next", spec);
                        smoke_idx += 1;
                    }
                    _ => {
                        smoke = Some(spec.clone());
                        break;
                    }
                }
            }

            let record = AttemptRecord {
                attempt,
                code: Some(code.clone()),
                smoke: smoke.clone(),
                outcome: outcome.clone(),
            };
            observer.on_attempt(&record).await;
            history.push(record);

            match outcome {
                ExecutionOutcome::Success(metrics) => {
                    let smoke = match smoke {
                        Some(s) => s,
                        None => return self.exhausted(attempt, history),
                    };
                    info!(
                        "✓ attempt {} passed smoke test on {} ({:.2}%)",
                        attempt, smoke, metrics.return_pct
                    );
                    return RepairReport {
                        end: RepairEnd::Succeeded {
                            code,
                            smoke,
                            metrics,
                        },
                        history,
                    };
                }
                ExecutionOutcome::Failure(f) => match f.category {
                    FailureCategory::Cancelled => {
                        return RepairReport {
                            end: RepairEnd::Cancelled { attempt },
                            history,
                        };
                    }
                    // Nothing left to validate on; more generations cannot help.
                    FailureCategory::DatasetFetchError => {
                        return self.exhausted(attempt, history);
                    }
                    _ => {
                        info!(
                            "✗ attempt {} failed smoke test: {} {}",
                            attempt, f.category, f.message
                        );
                        last_defect = Some((code, f));
                        if attempt < self.max_debug_iterations {
                            attempt += 1;
                            continue;
                        }
                        return self.exhausted(attempt, history);
                    }
                },
            }
        }
    }

    fn exhausted(&self, attempt: u32, history: Vec<AttemptRecord>) -> RepairReport {
        let failure = history
            .last()
            .and_then(|r| r.outcome.as_failure().cloned())
            .unwrap_or_else(|| Failure {
                category: FailureCategory::RuntimeError,
                message: "no attempt recorded".to_string(),
                traceback: String::new(),
            });
        warn!(
            "✗ repair loop exhausted at attempt {}: {} {}",
            attempt, failure.category, failure.message
        );
        RepairReport {
            end: RepairEnd::Exhausted { attempt, failure },
            history,
        }
    }
}
