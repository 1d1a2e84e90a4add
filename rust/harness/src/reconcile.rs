//! Produce the job's effective configuration exactly once.
//!
//! Node rank 0 merges the vendor override onto the base config and writes the
//! result; every other rank polls for the file and reads it back. The file is
//! written to a sibling temp path and renamed into place, so a reader that
//! sees it also sees complete contents.
//!
//! A file left over from an earlier run at the same path is indistinguishable
//! from a fresh one; callers clean the work directory between jobs.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use xbench_config::{ConfigError, EffectiveConfig};

use crate::spec::JobSpec;

/// Exponential backoff schedule for the config-ready poll.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

/// Load base + vendor documents and merge them.
pub fn merge_files(base: &Path, vendor: &Path) -> Result<EffectiveConfig, ReconcileError> {
    let base_cfg = EffectiveConfig::load(base)?;
    let vendor_cfg = EffectiveConfig::load(vendor)?;
    tracing::debug!(
        base = %base.display(),
        vendor = %vendor.display(),
        base_keys = base_cfg.len(),
        vendor_keys = vendor_cfg.len(),
        "merging vendor config"
    );
    Ok(base_cfg.merged_with(&vendor_cfg))
}

/// Atomically (re)write `config` at `path`.
pub fn write_effective(config: &EffectiveConfig, path: &Path) -> Result<(), ReconcileError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| ReconcileError::Io(parent.to_path_buf(), e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, config.to_canonical_string())
        .map_err(|e| ReconcileError::Io(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| ReconcileError::Io(path.to_path_buf(), e))?;
    Ok(())
}

/// Poll until `path` exists, then load it.
///
/// Sleeps follow `backoff` and never overshoot the deadline. Fails with
/// [`ReconcileError::ConfigNotReady`] once `timeout` has elapsed. Any lookup
/// error other than "not found" (a permission problem, say) fails at once as
/// [`ReconcileError::Io`].
pub async fn wait_for_config(
    path: &Path,
    timeout: Duration,
    backoff: Backoff,
) -> Result<EffectiveConfig, ReconcileError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut delay = backoff.initial;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let ready = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ReconcileError::Io(path.to_path_buf(), e))?;
        if ready {
            tracing::debug!(
                path = %path.display(),
                attempts,
                "effective config ready after {:.2?}",
                start.elapsed()
            );
            return Ok(EffectiveConfig::load(path)?);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::ConfigNotReady {
                path: path.to_path_buf(),
                waited: now - start,
            });
        }

        tracing::trace!(path = %path.display(), attempts, ?delay, "effective config not ready");
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(backoff.max);
    }
}

/// Produce the effective config for `spec`'s node.
///
/// The writer rank merges and writes; the others wait for the writer.
pub async fn reconcile(spec: &JobSpec, backoff: Backoff) -> Result<EffectiveConfig, ReconcileError> {
    let out = spec.effective_config_path();

    if spec.is_config_writer() {
        let merged = merge_files(&spec.base_config_path(), &spec.config_file)?;
        write_effective(&merged, &out)?;
        tracing::info!("Wrote effective config ({} keys) to {}", merged.len(), out.display());
        Ok(merged)
    } else {
        tracing::info!(
            "Node {} waiting for effective config at {}",
            spec.node_rank,
            out.display()
        );
        wait_for_config(&out, Duration::from_secs(spec.ready_timeout_secs), backoff).await
    }
}

/// Errors that can occur while reconciling configuration.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("effective config {} not written within {waited:.1?}", .path.display())]
    ConfigNotReady { path: PathBuf, waited: Duration },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error on effective config {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
