//! Integration tests for cross-rank evaluation.
//!
//! Ranks are simulated as threads joined by a `ThreadGroup`, which performs
//! the same blocking sum-reduction a multi-process backend would.

use std::thread;

use xbench_eval::{
    EvalAccumulator, EvalError, Evaluator, InferenceModel, InferenceOutput, LocalReducer,
    ThreadGroup,
};

/// Classifier stub whose batches carry their own hit counts.
struct CountingModel;

#[derive(Clone, Copy)]
struct Batch {
    top1: f64,
    top5: f64,
    size: usize,
}

impl InferenceModel for CountingModel {
    type Batch = Batch;

    fn process_batch(&mut self, batch: Batch) -> Batch {
        batch
    }

    fn inference(&mut self, batch: &Batch) -> InferenceOutput {
        InferenceOutput {
            loss: 1.0 - batch.top1 / batch.size as f64,
            top1: batch.top1,
            top5: batch.top5,
        }
    }

    fn batch_size(batch: &Batch) -> usize {
        batch.size
    }
}

fn batches() -> Vec<Batch> {
    vec![
        Batch { top1: 8.0, top5: 9.0, size: 10 },
        Batch { top1: 7.0, top5: 9.0, size: 10 },
        Batch { top1: 9.0, top5: 10.0, size: 10 },
    ]
}

#[test]
fn test_two_ranks_match_single_process() {
    let single = Evaluator::new(LocalReducer)
        .evaluate(&mut CountingModel, batches(), EvalAccumulator::new())
        .unwrap();

    let all = batches();
    let shards = vec![all[..2].to_vec(), all[2..].to_vec()];

    let handles: Vec<_> = ThreadGroup::create(2)
        .into_iter()
        .zip(shards)
        .map(|(rank, shard)| {
            thread::spawn(move || {
                Evaluator::new(rank)
                    .evaluate(&mut CountingModel, shard, EvalAccumulator::new())
                    .unwrap()
            })
        })
        .collect();

    for h in handles {
        let outcome = h.join().unwrap();
        assert_eq!(outcome.accumulator, single.accumulator);
        assert_eq!(outcome.top1, single.top1);
        assert_eq!(outcome.top5, single.top5);
    }

    assert!((single.top1 - 24.0 / 30.0).abs() < 1e-12);
    assert!((single.top5 - 28.0 / 30.0).abs() < 1e-12);
}

#[test]
fn test_rank_with_empty_shard_still_gets_global_result() {
    let shards = vec![batches(), Vec::new()];

    let handles: Vec<_> = ThreadGroup::create(2)
        .into_iter()
        .zip(shards)
        .map(|(rank, shard)| {
            thread::spawn(move || {
                Evaluator::new(rank).evaluate(&mut CountingModel, shard, EvalAccumulator::new())
            })
        })
        .collect();

    for h in handles {
        let outcome = h.join().unwrap().unwrap();
        assert_eq!(outcome.accumulator.sum_samples, 30.0);
    }
}

#[test]
fn test_all_ranks_empty_is_error_everywhere() {
    let handles: Vec<_> = ThreadGroup::create(3)
        .into_iter()
        .map(|rank| {
            thread::spawn(move || {
                Evaluator::new(rank).evaluate(
                    &mut CountingModel,
                    Vec::<Batch>::new(),
                    EvalAccumulator::new(),
                )
            })
        })
        .collect();

    for h in handles {
        assert!(matches!(
            h.join().unwrap(),
            Err(EvalError::EmptyEvaluationSet)
        ));
    }
}
