pub mod config;
pub mod eager;
pub mod executor;
pub mod metrics;
pub mod retry;
pub mod tasks;
pub mod worker;

pub use config::WorkerConfig;
pub use eager::EagerRunner;
pub use executor::{Execution, Outcome};
pub use metrics::WorkerMetrics;
pub use retry::{decide, Disposition};
pub use tasks::register_builtin_tasks;
pub use worker::Worker;
