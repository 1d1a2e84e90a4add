//! Throughput and MFU extraction from a finished training log.
//!
//! The only structure relied on is the marker phrase inside a `|`-delimited
//! field, followed by `:` and a millisecond value, e.g.
//!
//! ```text
//!  iteration  10/ 100 | consumed samples: 5120 | elapsed time per iteration (ms): 820.0 | learning rate: 1.0E-04 |
//! ```
//!
//! The field is located by the marker rather than by position. A value that
//! is not a positive finite number is rejected rather than trusted.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use xbench_config::ModelConstants;

/// Substring identifying the per-iteration timing field.
pub const STEP_TIME_MARKER: &str = "elapsed time per iteration (ms)";

/// Value used for every metric that could not be measured.
pub const SENTINEL: f64 = -1.0;

/// Why metrics hold sentinel values instead of measurements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum MetricUnavailable {
    /// No line carried an acceptable step time.
    NoMarker,
    /// The log could not be read.
    UnreadableLog(String),
}

/// Per-step performance derived from one log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_time_seconds: f64,
    pub tokens_per_second_system: f64,
    pub tokens_per_second_per_device: f64,
    pub model_flops_utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<MetricUnavailable>,
}

impl StepMetrics {
    #[must_use]
    pub fn unmeasured(reason: MetricUnavailable) -> Self {
        Self {
            step_time_seconds: SENTINEL,
            tokens_per_second_system: SENTINEL,
            tokens_per_second_per_device: SENTINEL,
            model_flops_utilization: SENTINEL,
            unavailable: Some(reason),
        }
    }

    #[must_use]
    pub fn is_measured(&self) -> bool {
        self.unavailable.is_none()
    }

    /// Derive throughput metrics from a measured step time.
    #[must_use]
    pub fn from_step_time(step_time_seconds: f64, params: &ThroughputParams) -> Self {
        let system = params.global_batch_size * params.seq_length / step_time_seconds;
        let per_device = system / params.device_count;
        Self {
            step_time_seconds,
            tokens_per_second_system: system,
            tokens_per_second_per_device: per_device,
            model_flops_utilization: per_device * params.flops_per_token
                / params.theoretical_peak_flops,
            unavailable: None,
        }
    }
}

/// Model and topology constants needed to turn a step time into throughput.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputParams {
    pub global_batch_size: f64,
    pub seq_length: f64,
    pub device_count: f64,
    pub theoretical_peak_flops: f64,
    /// Effective FLOPs per token for one forward + backward pass.
    pub flops_per_token: f64,
}

impl ThroughputParams {
    /// `device_count` is the job's total device count and must be positive.
    #[must_use]
    pub fn new(constants: &ModelConstants, device_count: u32) -> Self {
        Self {
            global_batch_size: constants.gbs as f64,
            seq_length: constants.seqlength as f64,
            device_count: f64::from(device_count),
            theoretical_peak_flops: constants.theoryflops,
            flops_per_token: constants.flops_per_token,
        }
    }
}

/// Parse the step time in seconds from one log line, if it carries one.
#[must_use]
pub fn parse_step_time(line: &str) -> Option<Result<f64, String>> {
    let field = line.split('|').find(|f| f.contains(STEP_TIME_MARKER))?;
    let raw = field
        .split_once(':')
        .map(|(_, v)| v.trim())
        .unwrap_or_default();

    let ms = match raw.parse::<f64>() {
        Ok(ms) => ms,
        Err(_) => return Some(Err(format!("not a number: {raw:?}"))),
    };
    if !ms.is_finite() || ms <= 0.0 {
        return Some(Err(format!("not a positive finite duration: {ms}")));
    }
    Some(Ok(ms / 1000.0))
}

/// Scan `reader` forward line by line and return the last acceptable step time.
///
/// Lines are decoded lossily, so stray non-UTF-8 output from the training
/// process does not stop the scan.
pub fn last_step_time<R: BufRead>(mut reader: R) -> io::Result<Option<f64>> {
    let mut last = None;
    let mut buf = Vec::new();
    let mut lineno = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lineno += 1;
        match parse_step_time(&String::from_utf8_lossy(&buf)) {
            Some(Ok(seconds)) => last = Some(seconds),
            Some(Err(reason)) => {
                tracing::warn!(line = lineno, "ignoring step time: {reason}");
            }
            None => {}
        }
    }
    Ok(last)
}

/// Extract step metrics from the log at `log_path`.
///
/// Never fails: a missing marker or unreadable log yields sentinel values
/// with the reason recorded in [`StepMetrics::unavailable`].
#[must_use]
pub fn extract(log_path: &Path, params: &ThroughputParams) -> StepMetrics {
    let scanned = File::open(log_path).and_then(|f| last_step_time(BufReader::new(f)));

    match scanned {
        Ok(Some(seconds)) => StepMetrics::from_step_time(seconds, params),
        Err(e) => {
            tracing::warn!("cannot read {} for metrics: {e}", log_path.display());
            StepMetrics::unmeasured(MetricUnavailable::UnreadableLog(e.to_string()))
        }
        Ok(None) => {
            tracing::warn!(
                "no `{STEP_TIME_MARKER}` line in {}, reporting sentinel metrics",
                log_path.display()
            );
            StepMetrics::unmeasured(MetricUnavailable::NoMarker)
        }
    }
}
