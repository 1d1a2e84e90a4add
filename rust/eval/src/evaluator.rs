//! Evaluation pass over a batch sequence with a single cross-rank reduction.

use crate::{EvalAccumulator, EvalError, Reducer};

/// Output of one inference call on a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceOutput {
    pub loss: f64,
    /// Number of samples whose top-1 prediction was correct.
    pub top1: f64,
    /// Number of samples whose label was among the top-5 predictions.
    pub top5: f64,
}

/// The model-specific step logic the evaluator drives.
pub trait InferenceModel {
    type Batch;

    /// Move/convert a raw batch into whatever the model consumes.
    fn process_batch(&mut self, batch: Self::Batch) -> Self::Batch;

    fn inference(&mut self, batch: &Self::Batch) -> InferenceOutput;

    /// Number of samples in a processed batch.
    fn batch_size(batch: &Self::Batch) -> usize;

    /// Toggle inference-only execution (no gradient tracking).
    fn set_inference_mode(&mut self, _enabled: bool) {}
}

/// Merged result of an evaluation pass, identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    pub accumulator: EvalAccumulator,
    pub top1: f64,
    pub top5: f64,
    /// Batches this rank evaluated before the reduction.
    pub local_batches: usize,
}

/// Runs evaluation passes, reducing through `R`.
#[derive(Debug)]
pub struct Evaluator<R> {
    reducer: R,
}

impl<R: Reducer> Evaluator<R> {
    #[must_use]
    pub fn new(reducer: R) -> Self {
        Self { reducer }
    }

    #[must_use]
    pub fn reducer(&self) -> &R {
        &self.reducer
    }

    /// Evaluate `batches` and return the merged counts and means.
    ///
    /// `acc` is reset before the pass. When the reducer is active, exactly one
    /// `all_reduce_sum` is issued after the local pass, so every rank must
    /// call this with its shard.
    pub fn evaluate<M, I>(
        &self,
        model: &mut M,
        batches: I,
        mut acc: EvalAccumulator,
    ) -> Result<EvalOutcome, EvalError>
    where
        M: InferenceModel,
        I: IntoIterator<Item = M::Batch>,
    {
        acc.reset();

        model.set_inference_mode(true);
        let mut local_batches = 0usize;
        for batch in batches {
            let batch = model.process_batch(batch);
            let out = model.inference(&batch);
            acc.update(out.top1, out.top5, M::batch_size(&batch));
            local_batches += 1;
        }
        model.set_inference_mode(false);

        tracing::debug!(
            rank = self.reducer.rank(),
            local_batches,
            local_samples = acc.sum_samples,
            "local evaluation pass done"
        );

        if self.reducer.is_active() {
            let mut totals = acc.to_array();
            self.reducer.all_reduce_sum(&mut totals)?;
            acc = EvalAccumulator::from_array(totals);
        }

        let (top1, top5) = acc.means()?;

        tracing::info!(
            rank = self.reducer.rank(),
            world_size = self.reducer.world_size(),
            samples = acc.sum_samples,
            "eval top1 = {top1:.4}, top5 = {top5:.4}"
        );

        Ok(EvalOutcome {
            accumulator: acc,
            top1,
            top5,
            local_batches,
        })
    }
}
