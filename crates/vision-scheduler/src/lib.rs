//! Vision task scheduler
//!
//! Keeps a pool of single-purpose worker pods (detection, localization,
//! fusion, multi-camera tracking), hands client tasks to free workers and
//! relays the workers' asynchronous results back to the clients.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod worker_pool;

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
