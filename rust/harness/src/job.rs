//! End-to-end run of one node: reconcile, build, launch, extract, report.

use std::path::PathBuf;

use xbench_config::{ConfigError, ModelConstants};

use crate::{
    command::{self, BuildError},
    metrics::{self, StepMetrics, ThroughputParams},
    reconcile::{self, Backoff, ReconcileError},
    report::{BenchmarkReport, ReportError},
    runner::{self, Launcher, RunError},
    spec::{JobSpec, SpecError},
};

/// What a finished node run produced.
#[derive(Debug)]
pub struct JobOutcome {
    /// Child exit code; `None` when it was killed by a signal.
    pub exit_code: Option<i32>,
    pub metrics: StepMetrics,
    pub report_path: PathBuf,
}

impl JobOutcome {
    /// Status for the harness process to exit with: the child's code when it
    /// fits in a process status, otherwise 1.
    #[must_use]
    pub fn process_exit_code(&self) -> u8 {
        process_exit_code(self.exit_code)
    }
}

fn process_exit_code(child: Option<i32>) -> u8 {
    child.and_then(|c| u8::try_from(c).ok()).unwrap_or(1)
}

/// Run `spec`'s node to completion.
///
/// Configuration, command construction and spawn failures abort the run. A
/// training process that exits non-zero does not: its metrics are still
/// extracted (usually as sentinels) and the report is written.
pub async fn run_job(spec: &JobSpec, launcher: &Launcher) -> Result<JobOutcome, JobError> {
    spec.validate()?;
    runner::write_pid_file(&spec.pid_path())?;

    let effective = reconcile::reconcile(spec, Backoff::default()).await?;
    let constants = ModelConstants::from_config(&effective).map_err(BuildError::from)?;

    let mut cmd = command::build(spec, &effective)?;
    let net_script = spec.net_script_path();
    if net_script.is_file() {
        let text = std::fs::read_to_string(&net_script)
            .map_err(|e| ConfigError::Io(net_script.display().to_string(), e))
            .map_err(BuildError::from)?;
        let net_env = command::parse_env_script(&text);
        tracing::info!(
            "Applying {} network variables from {}",
            net_env.len(),
            net_script.display()
        );
        cmd = cmd.with_env(net_env);
    }

    tracing::info!("Launching: {cmd}");
    let log_path = spec.log_path();

    let exit_code = match launcher.launch(&cmd, &log_path).await {
        Ok(outcome) => Some(outcome.exit_code),
        Err(RunError::TrainingProcessFailed {
            code,
            log_path,
            tail,
        }) => {
            tracing::error!(
                "Training process failed with exit code {code:?}, log: {}",
                log_path.display()
            );
            for line in &tail {
                tracing::error!("  | {line}");
            }
            code
        }
        Err(e) => return Err(e.into()),
    };

    let params = ThroughputParams::new(&constants, spec.world_size());
    let step_metrics = metrics::extract(&log_path, &params);
    if step_metrics.is_measured() {
        tracing::info!("Step time (s): {:.4}", step_metrics.step_time_seconds);
        tracing::info!(
            "System tokens per second: {:.2}",
            step_metrics.tokens_per_second_system
        );
        tracing::info!(
            "Tokens/p/s: {:.2}",
            step_metrics.tokens_per_second_per_device
        );
        tracing::info!("MFU: {:.4}", step_metrics.model_flops_utilization);
    }

    let report_path = spec.report_path();
    BenchmarkReport::new(spec, exit_code, step_metrics.clone()).write(&report_path)?;
    tracing::info!("Report written to {}", report_path.display());

    Ok(JobOutcome {
        exit_code,
        metrics: step_metrics,
        report_path,
    })
}

/// Errors that abort a node run.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_code_mirrors_child() {
        assert_eq!(process_exit_code(Some(0)), 0);
        assert_eq!(process_exit_code(Some(7)), 7);
        assert_eq!(process_exit_code(Some(255)), 255);
        assert_eq!(process_exit_code(Some(256)), 1);
        assert_eq!(process_exit_code(Some(-1)), 1);
        // Killed by a signal.
        assert_eq!(process_exit_code(None), 1);
    }
}
