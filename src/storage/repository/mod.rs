pub mod result_repo;
pub mod run_repo;

pub use result_repo::{parse_code_reference, FailedRunRepository, ResultRepository};
pub use run_repo::{CodeVersionRepository, RunRepository, RunSummaryUpdate};
