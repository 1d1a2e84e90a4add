//! Per-pass correctness counters.

use crate::EvalError;

/// Running top-1 / top-5 hit counts and sample count for one evaluation pass.
///
/// Counts only grow during a pass. After reduction every rank holds the same
/// merged values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalAccumulator {
    pub sum_top1: f64,
    pub sum_top5: f64,
    pub sum_samples: f64,
}

impl EvalAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Add one batch's hit counts and its size.
    pub fn update(&mut self, top1: f64, top5: f64, samples: usize) {
        self.sum_top1 += top1;
        self.sum_top5 += top5;
        self.sum_samples += samples as f64;
    }

    /// Flatten to the buffer handed to a sum-reduction.
    #[must_use]
    pub fn to_array(self) -> [f64; 3] {
        [self.sum_top1, self.sum_top5, self.sum_samples]
    }

    #[must_use]
    pub fn from_array([sum_top1, sum_top5, sum_samples]: [f64; 3]) -> Self {
        Self {
            sum_top1,
            sum_top5,
            sum_samples,
        }
    }

    /// `(sum_top1 / sum_samples, sum_top5 / sum_samples)`.
    pub fn means(&self) -> Result<(f64, f64), EvalError> {
        if self.sum_samples <= 0.0 {
            return Err(EvalError::EmptyEvaluationSet);
        }
        Ok((
            self.sum_top1 / self.sum_samples,
            self.sum_top5 / self.sum_samples,
        ))
    }
}
