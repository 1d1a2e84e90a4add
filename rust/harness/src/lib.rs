#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

//! xbench launch harness
//!
//! Reconciles vendor configuration, launches one node's training process,
//! and turns its log into comparable throughput metrics.

pub mod command;
pub mod job;
pub mod metrics;
pub mod reconcile;
pub mod report;
pub mod runner;
pub mod spec;

pub use command::{BuildError, LaunchCommand};
pub use job::{JobError, JobOutcome, run_job};
pub use metrics::{MetricUnavailable, StepMetrics, ThroughputParams};
pub use reconcile::ReconcileError;
pub use report::BenchmarkReport;
pub use runner::{Launcher, RunError};
pub use spec::{JobSpec, SpecError};
