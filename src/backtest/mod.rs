pub mod model;
pub mod pool;
pub mod service;
pub mod worker;

pub use pool::ExecutionPool;
pub use worker::ProcessSandbox;
