use crate::backtest::model::{ExecutionOutcome, GeneratedCode, Metrics};
use crate::dataset::DatasetSpec;
use crate::storage::repository::ResultRepository;
use log::{error, info};
use sea_orm::DatabaseConnection;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Gate for persistence.
    pub save_pct: f64,
    /// Advisory only.
    pub target_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            save_pct: 1.0,
            target_pct: 50.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub code: GeneratedCode,
    pub outcomes: BTreeMap<DatasetSpec, ExecutionOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    pub best_return_pct: Option<f64>,
    pub median_return_pct: Option<f64>,
    pub savable: bool,
    pub target_met: bool,
    pub rows_saved: usize,
    pub row_errors: usize,
}

impl RunResult {
    /// Successful datasets above the save threshold, best first.
    pub fn savable_rows(&self, thresholds: &Thresholds) -> Vec<(&DatasetSpec, &Metrics)> {
        let mut rows: Vec<_> = self
            .outcomes
            .iter()
            .filter_map(|(spec, o)| o.metrics().map(|m| (spec, m)))
            .filter(|(_, m)| m.return_pct > thresholds.save_pct)
            .collect();
        rows.sort_by(|a, b| b.1.return_pct.total_cmp(&a.1.return_pct));
        rows
    }
}

/// Statistics and gates over one fan-out. Pure; persists nothing.
pub fn summarize(
    run_id: &str,
    code: &GeneratedCode,
    outcomes: BTreeMap<DatasetSpec, ExecutionOutcome>,
    thresholds: &Thresholds,
) -> RunResult {
    let mut returns: Vec<f64> = outcomes
        .values()
        .filter_map(|o| o.metrics().map(|m| m.return_pct))
        .collect();
    returns.sort_by(|a, b| a.total_cmp(b));

    let success_count = returns.len();
    let best = returns.last().copied();
    RunResult {
        run_id: run_id.to_string(),
        code: code.clone(),
        failure_count: outcomes.len() - success_count,
        outcomes,
        success_count,
        best_return_pct: best,
        median_return_pct: median(&returns),
        savable: best.is_some_and(|b| b > thresholds.save_pct),
        target_met: best.is_some_and(|b| b > thresholds.target_pct),
        rows_saved: 0,
        row_errors: 0,
    }
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Per-dataset summary kept on the run row.
pub fn outcomes_json(outcomes: &BTreeMap<DatasetSpec, ExecutionOutcome>) -> String {
    let mut map = Map::new();
    for (spec, outcome) in outcomes {
        let v = match outcome {
            ExecutionOutcome::Success(m) => json!({
                "ok": true,
                "return_pct": m.return_pct,
                "trade_count": m.trade_count,
            }),
            ExecutionOutcome::Failure(f) => json!({
                "ok": false,
                "category": f.category.as_str(),
                "message": f.message,
            }),
        };
        map.insert(spec.to_string(), v);
    }
    Value::Object(map).to_string()
}

/// The only writer of `strategy_results`.
pub struct ResultAggregator {
    db: Arc<DatabaseConnection>,
    thresholds: Thresholds,
}

impl ResultAggregator {
    pub fn new(db: Arc<DatabaseConnection>, thresholds: Thresholds) -> Self {
        Self { db, thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Summarizes and appends one row per successful dataset above the save
    /// threshold. Rows are independent; a failed insert is counted in
    /// `row_errors` and does not stop the others.
    pub async fn aggregate(
        &self,
        run_id: &str,
        code: &GeneratedCode,
        outcomes: BTreeMap<DatasetSpec, ExecutionOutcome>,
    ) -> RunResult {
        let mut result = summarize(run_id, code, outcomes, &self.thresholds);
        let mut saved = 0usize;
        let mut errors = 0usize;
        for (spec, metrics) in result.savable_rows(&self.thresholds) {
            let target_met = metrics.return_pct > self.thresholds.target_pct;
            match ResultRepository::insert(
                self.db.as_ref(),
                run_id,
                spec,
                code.attempt,
                metrics,
                target_met,
            )
            .await
            {
                Ok(_) => {
                    saved += 1;
                    info!(
                        "💾 {} {}: {:.2}%{}",
                        run_id,
                        spec,
                        metrics.return_pct,
                        if target_met { " (target met)" } else { "" }
                    );
                }
                Err(e) => {
                    errors += 1;
                    error!("❌ could not save result {} {}: {}", run_id, spec, e);
                }
            }
        }
        result.rows_saved = saved;
        result.row_errors = errors;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::model::FailureCategory;
    use crate::storage::connection::establish_connection;
    use crate::testing::metrics;

    fn spec(s: &str) -> DatasetSpec {
        DatasetSpec::new(s, "1h", 30, "binance")
    }

    fn outcomes(items: &[(&str, Option<f64>)]) -> BTreeMap<DatasetSpec, ExecutionOutcome> {
        items
            .iter()
            .map(|(s, r)| {
                let o = match r {
                    Some(r) => ExecutionOutcome::Success(metrics(*r)),
                    None => ExecutionOutcome::fetch_error("404"),
                };
                (spec(s), o)
            })
            .collect()
    }

    #[test]
    fn two_of_three_succeed() {
        let r = summarize(
            "r",
            &GeneratedCode::new(0, "c"),
            outcomes(&[("A", Some(5.0)), ("B", Some(12.0)), ("C", None)]),
            &Thresholds::default(),
        );
        assert_eq!(r.success_count, 2);
        assert_eq!(r.failure_count, 1);
        assert_eq!(r.best_return_pct, Some(12.0));
        assert_eq!(r.median_return_pct, Some(8.5));
        assert!(r.savable);
        assert!(!r.target_met);
    }

    #[test]
    fn below_threshold_is_not_savable() {
        let r = summarize(
            "r",
            &GeneratedCode::new(0, "c"),
            outcomes(&[("A", Some(0.5)), ("B", Some(-3.0)), ("C", Some(0.2))]),
            &Thresholds::default(),
        );
        assert!(!r.savable);
        assert_eq!(r.median_return_pct, Some(0.2));
        assert!(r.savable_rows(&Thresholds::default()).is_empty());
    }

    #[test]
    fn no_successes() {
        let r = summarize(
            "r",
            &GeneratedCode::new(0, "c"),
            outcomes(&[("A", None)]),
            &Thresholds::default(),
        );
        assert_eq!(r.best_return_pct, None);
        assert_eq!(r.median_return_pct, None);
        assert!(!r.savable);
    }

    #[test]
    fn outcome_summary_marks_failures() {
        let v: Value = serde_json::from_str(&outcomes_json(&outcomes(&[
            ("A", Some(5.0)),
            ("C", None),
        ])))
        .unwrap();
        assert_eq!(v["A:1h:30d:binance"]["ok"], true);
        assert_eq!(
            v["C:1h:30d:binance"]["category"],
            FailureCategory::DatasetFetchError.as_str()
        );
    }

    #[tokio::test]
    async fn persists_only_savable_successes() {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let agg = ResultAggregator::new(db.clone(), Thresholds::default());
        let mut all = outcomes(&[("A", Some(5.0)), ("B", Some(60.0)), ("C", Some(0.5))]);
        all.insert(
            spec("D"),
            ExecutionOutcome::runtime("ZeroDivisionError", "Traceback"),
        );

        let r = agg.aggregate("r1", &GeneratedCode::new(2, "c"), all).await;
        assert_eq!(r.rows_saved, 2);
        assert!(r.target_met);

        let rows = ResultRepository::list_for_run(db.as_ref(), "r1").await.unwrap();
        let symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["B", "A"]);
        assert!(rows.iter().all(|r| r.attempt_number == 2 && r.code_reference == "r1#2"));
        assert!(rows[0].target_met && !rows[1].target_met);
    }
}
