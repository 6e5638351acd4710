use crate::app_state::{AppEvent, RunSummary};
use crate::run::{RunDetail, RunOrchestrator};
use std::fmt::Write as _;
use tokio::sync::mpsc;

/// One idea per line; blank lines and `#` comments are skipped.
pub fn parse_batch_file(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn send_runs(
    orch: &RunOrchestrator,
    tx: &mpsc::UnboundedSender<AppEvent>,
    limit: u64,
) {
    match orch.list_runs(limit).await {
        Ok(runs) => {
            let list = runs.into_iter().map(RunSummary::from).collect();
            let _ = tx.send(AppEvent::Runs(list));
        }
        Err(e) => {
            let _ = tx.send(AppEvent::Error(format!("failed to list runs: {}", e)));
        }
    }
}

pub async fn send_detail(
    orch: &RunOrchestrator,
    tx: &mpsc::UnboundedSender<AppEvent>,
    run_id: &str,
) {
    match orch.run_detail(run_id).await {
        Ok(Some(detail)) => {
            let _ = tx.send(AppEvent::Detail(Box::new(detail)));
        }
        Ok(None) => {
            let _ = tx.send(AppEvent::Error(format!("no run {}", run_id)));
        }
        Err(e) => {
            let _ = tx.send(AppEvent::Error(format!("failed to load {}: {}", run_id, e)));
        }
    }
}

fn pct(v: Option<f64>) -> String {
    v.map(|x| format!("{:+.2}%", x))
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_runs(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "no runs yet".to_string();
    }
    let mut out = format!(
        "{:<48} {:<16} {:>4} {:>4} {:>10} {:>5}",
        "RUN", "STATUS", "ATT", "OK", "BEST", "ROWS"
    );
    for r in runs {
        let _ = write!(
            out,
            "\n{:<48} {:<16} {:>4} {:>4} {:>10} {:>5}{}",
            r.run_id,
            r.status,
            r.attempts,
            r.success_count,
            pct(r.best_return_pct),
            r.rows_saved,
            if r.target_met { " ★" } else { "" }
        );
    }
    out
}

pub fn format_detail(d: &RunDetail) -> String {
    let r = &d.run;
    let mut out = String::new();
    let _ = writeln!(out, "run      {}", r.run_id);
    let _ = writeln!(out, "idea     {}", r.idea);
    let _ = writeln!(
        out,
        "status   {} after {} attempts ({} code versions)",
        r.status, r.attempts, d.versions
    );
    if let Some(smoke) = &r.smoke_dataset {
        let _ = writeln!(out, "smoke    {}", smoke);
    }
    let _ = writeln!(
        out,
        "returns  best {} median {} | {} succeeded, {} rows saved{}",
        pct(r.best_return_pct),
        pct(r.median_return_pct),
        r.success_count,
        r.rows_saved,
        if r.target_met { ", target met" } else { "" }
    );
    if let Some(err) = &r.last_error {
        let _ = writeln!(out, "error    {}", err);
    }
    if let Some(m) = &d.marker {
        let _ = writeln!(
            out,
            "marker   {} at attempt {}{}",
            m.reason,
            m.exhausted_at_attempt,
            match (&m.last_error_category, &m.last_error_message) {
                (Some(c), Some(msg)) => format!(": {} {}", c, msg),
                (Some(c), None) => format!(": {}", c),
                (None, Some(msg)) => format!(": {}", msg),
                (None, None) => String::new(),
            }
        );
    }
    for row in &d.results {
        let _ = writeln!(
            out,
            "  {:<28} ret {:>9} b&h {:>9} dd {:>8} sharpe {:>6.2} trades {:>4}{}",
            row.dataset,
            format!("{:+.2}%", row.return_pct),
            format!("{:+.2}%", row.buy_hold_pct),
            format!("{:.2}%", row.max_drawdown_pct),
            row.sharpe,
            row.trade_count,
            if row.target_met { " ★" } else { "" }
        );
    }
    if let Some(v) = &d.accepted_code {
        let _ = writeln!(out, "--- accepted code (attempt {}) ---", v.attempt);
        let _ = writeln!(out, "{}", v.code.as_deref().unwrap_or(""));
    }
    out.trim_end().to_string()
}
