//! Collective sum-reduction behind a swappable interface.
//!
//! The real multi-process backend lives outside this crate; anything that can
//! sum a small `f64` buffer across ranks implements [`Reducer`].
//!
//! A reduction is a blocking collective: every rank must call it. If one rank
//! never arrives, the others wait forever. There is no timeout at this layer.

use std::{
    fmt,
    sync::{Arc, Barrier, Mutex},
};

/// Sum-reduction across all ranks of a job.
pub trait Reducer: fmt::Debug {
    /// Whether a multi-rank context is initialized. When `false` the
    /// evaluator skips the reduction and uses local counts as-is.
    fn is_active(&self) -> bool;

    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Sum `data` element-wise across all ranks, in place. Every rank ends up
    /// with the same values.
    fn all_reduce_sum(&self, data: &mut [f64]) -> Result<(), ReduceError>;
}

/// No distributed context: one rank, reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl Reducer for LocalReducer {
    fn is_active(&self) -> bool {
        false
    }

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce_sum(&self, _data: &mut [f64]) -> Result<(), ReduceError> {
        Ok(())
    }
}

struct GroupShared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// In-process collective: ranks are threads sharing one group.
///
/// Each rank posts its buffer, waits for all the others, then sums every slot
/// in rank order so all ranks compute bit-identical results.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create `world_size` connected rank handles, one per participating thread.
    #[must_use]
    pub fn create(world_size: usize) -> Vec<ThreadRank> {
        assert!(world_size > 0, "world_size must be at least 1");
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| ThreadRank {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's handle into a [`ThreadGroup`].
pub struct ThreadRank {
    rank: usize,
    world_size: usize,
    shared: Arc<GroupShared>,
}

impl fmt::Debug for ThreadRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRank")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl Reducer for ThreadRank {
    fn is_active(&self) -> bool {
        true
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_sum(&self, data: &mut [f64]) -> Result<(), ReduceError> {
        {
            let mut slots = self.shared.slots.lock().map_err(|_| ReduceError::Poisoned)?;
            slots[self.rank] = data.to_vec();
        }

        // Everyone has posted.
        self.shared.barrier.wait();

        let summed = {
            let slots = self.shared.slots.lock().map_err(|_| ReduceError::Poisoned)?;
            sum_slots(&slots, data.len())
        };

        // Everyone has read; slots may be reused by the next reduction.
        self.shared.barrier.wait();

        let summed = summed?;
        data.copy_from_slice(&summed);
        tracing::trace!(rank = self.rank, ?summed, "all_reduce_sum complete");
        Ok(())
    }
}

fn sum_slots(slots: &[Vec<f64>], len: usize) -> Result<Vec<f64>, ReduceError> {
    let mut out = vec![0.0; len];
    for (rank, slot) in slots.iter().enumerate() {
        if slot.len() != len {
            return Err(ReduceError::LengthMismatch {
                rank,
                expected: len,
                got: slot.len(),
            });
        }
        for (o, v) in out.iter_mut().zip(slot) {
            *o += v;
        }
    }
    Ok(out)
}

/// Errors raised by a reduction backend.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("rank {rank} contributed {got} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    #[error("reduction group state poisoned by a panicking rank")]
    Poisoned,
    #[error("communication backend failed: {0}")]
    Backend(String),
}
