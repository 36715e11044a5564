//! Core logic engine: scheduling, the job queue, the bounded worker, and the
//! version chain.
//!
//! Control flow: [`Scheduler`] enqueues jobs on the [`JobQueue`], the
//! [`Worker`] claims them and runs the [`Distiller`], and the
//! [`VersionChainManager`] commits each result as a new active version.

pub mod diff;
pub mod distiller;
pub mod queue;
pub mod scheduler;
pub mod versions;
pub mod worker;

#[cfg(test)]
mod testing;

pub use diff::{CategoryDiff, VersionDiff, diff_versions};
pub use distiller::{
    Distillation, DistillOptions, Distiller, DomainContext, OpenAiDistiller, Usage,
};
pub use queue::JobQueue;
pub use scheduler::{Scheduler, SchedulerReport, TriggerPolicy, spawn_scheduler_loop};
pub use versions::{VersionChainManager, VersionOrigin};
pub use worker::{TickOutcome, Worker, WorkerSettings, spawn_worker_loop};
