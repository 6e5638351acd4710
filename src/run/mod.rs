pub mod aggregate;
pub mod orchestrator;
pub mod repair;

pub use aggregate::Thresholds;
pub use orchestrator::{RunConfig, RunDetail, RunOrchestrator};

use chrono::Local;
use rand::Rng;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Generating,
    Repairing,
    Fanout,
    Saved,
    BelowThreshold,
    NoSuccess,
    Exhausted,
    Cancelled,
    Error,
}

impl RunStatus {
    /// Statuses a live run task passes through.
    pub const ACTIVE: [RunStatus; 3] = [Self::Generating, Self::Repairing, Self::Fanout];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generating => "GENERATING",
            Self::Repairing => "REPAIRING",
            Self::Fanout => "FANOUT",
            Self::Saved => "SAVED",
            Self::BelowThreshold => "BELOW_THRESHOLD",
            Self::NoSuccess => "NO_SUCCESS",
            Self::Exhausted => "EXHAUSTED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SLUG_MAX: usize = 40;

/// `YYYYMMDD_HHMMSS_<slug>_<4 hex>`.
pub fn new_run_id(idea: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!(
        "{}_{}_{:04x}",
        Local::now().format("%Y%m%d_%H%M%S"),
        slugify(idea),
        suffix
    )
}

fn slugify(idea: &str) -> String {
    let mut slug = String::new();
    let mut gap = false;
    for c in idea.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('_');
            }
            gap = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            gap = true;
        }
        if slug.len() >= SLUG_MAX {
            break;
        }
    }
    slug.truncate(SLUG_MAX);
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "idea".to_string()
    } else {
        slug
    }
}
