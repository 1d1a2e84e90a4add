//! Per-rank benchmark result record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xbench_config::Framework;

use crate::{metrics::StepMetrics, spec::JobSpec};

/// What one node reports after its training process ends.
///
/// Always written, with sentinel metrics when nothing was measured, so
/// comparison tooling can rely on every field being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub vendor: String,
    pub case_name: String,
    pub model_name: String,
    pub framework: Framework,
    pub round: u32,
    pub node_rank: u32,
    pub nnodes: u32,
    pub nproc: u32,
    /// Child exit code; `None` when it was killed by a signal.
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    pub metrics: StepMetrics,
    pub finished_at: String,
}

impl BenchmarkReport {
    #[must_use]
    pub fn new(spec: &JobSpec, exit_code: Option<i32>, metrics: StepMetrics) -> Self {
        Self {
            vendor: spec.vendor.clone(),
            case_name: spec.case_name.clone(),
            model_name: spec.model_name.clone(),
            framework: spec.framework,
            round: spec.round,
            node_rank: spec.node_rank,
            nnodes: spec.nnodes,
            nproc: spec.nproc,
            exit_code,
            log_path: spec.log_path(),
            metrics,
            finished_at: chrono::Local::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ReportError::Io(parent.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ReportError::Serialize(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, json + "\n").map_err(|e| ReportError::Io(path.to_path_buf(), e))
    }

    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ReportError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| ReportError::Serialize(path.to_path_buf(), e.to_string()))
    }
}

/// Errors that can occur when persisting a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to read/write report {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to (de)serialize report {0}: {1}")]
    Serialize(PathBuf, String),
}
