pub mod code_version;
pub mod failed_run;
pub mod run;
pub mod strategy_result;
