use crate::run::RunDetail;
use crate::storage::entity::run;

/// One line of the run listing.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub attempts: i32,
    pub success_count: i32,
    pub best_return_pct: Option<f64>,
    pub rows_saved: i32,
    pub target_met: bool,
}

impl From<run::Model> for RunSummary {
    fn from(m: run::Model) -> Self {
        Self {
            run_id: m.run_id,
            status: m.status,
            attempts: m.attempts,
            success_count: m.success_count,
            best_return_pct: m.best_return_pct,
            rows_saved: m.rows_saved,
            target_met: m.target_met,
        }
    }
}

#[derive(Debug)]
pub enum AppEvent {
    Log(String),
    Message(String),
    Error(String),
    Runs(Vec<RunSummary>),
    Detail(Box<RunDetail>),
}
