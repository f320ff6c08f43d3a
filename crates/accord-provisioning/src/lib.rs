//! Accord Provisioning - deferred identity operations with retry and backoff
//!
//! Tasks move `pending -> processing -> completed | failed`, going back to
//! `pending` with a later `scheduled_at` after a transient failure while
//! retries remain.

pub mod engine;
pub mod retry;
pub mod worker;

#[cfg(test)]
mod tests;

pub use engine::{BatchReport, EngineSettings, ProvisioningEngine};
pub use retry::RetryPolicy;
pub use worker::{ProvisioningWorker, WorkerConfig};
