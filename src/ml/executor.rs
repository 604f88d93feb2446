// ============================================================
// Layer 5 — Executors
// ============================================================
// The loop is written against one capability interface:
//
//   Executor
//     ├── LocalExecutor        rank 0 of 1; `device_ids` lists
//     │                        every local device
//     └── DistributedExecutor  rank r of N over a Collective
//
// Once the model is built the loop calls `broadcast` so every
// rank starts from rank 0's weights. After backward it calls
// `synchronize`, the only cross-rank point of a training step.
// Gradients are averaged over all ranks. A parameter that a
// rank never touched contributes zeros rather than blocking,
// and stays without a gradient only if no rank touched it.
//
// The shipped collective is an in-process group: one thread
// per rank meeting at a condition variable over a shared
// reduction buffer. A rank that fails aborts the group so the
// others return an error instead of waiting forever.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::ml::params::{GradientSet, ParamStore};

pub trait Executor<B: Backend>: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Devices this rank drives.
    fn device_ids(&self) -> &[usize];

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// Rank zero owns logging, evaluation output and checkpoints.
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Make every rank start from rank zero's parameter values.
    fn broadcast(&self, params: &mut ParamStore<B>) -> Result<()>;

    /// Make every rank hold the same, averaged gradients.
    fn synchronize(&self, params: &ParamStore<B>, grads: &mut GradientSet<B>) -> Result<()>;
}

// ─── Local ────────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    device_ids: Vec<usize>,
}

impl LocalExecutor {
    pub fn new(num_devices: usize) -> Self {
        Self { device_ids: (0..num_devices.max(1)).collect() }
    }
}

impl<B: Backend> Executor<B> for LocalExecutor {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    fn broadcast(&self, _params: &mut ParamStore<B>) -> Result<()> {
        Ok(())
    }

    fn synchronize(&self, _params: &ParamStore<B>, _grads: &mut GradientSet<B>) -> Result<()> {
        Ok(())
    }
}

// ─── Collectives ──────────────────────────────────────────────────────────────
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;

    /// Element-wise sum of `values` across all ranks. Every rank must
    /// call this the same number of times with equally long buffers.
    fn all_reduce_sum(&self, rank: usize, values: Vec<f32>) -> Result<Vec<f32>>;

    /// Wake every rank blocked in a reduction; they and all later calls fail
    /// with [`GroupAborted`]. A rank that stops early must call this.
    fn abort(&self);
}

/// Returned by reductions of a group that a failing rank tore down.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("collective group aborted by another rank")]
pub struct GroupAborted;

#[derive(Debug, Default)]
struct Round {
    /// Running sum of the current round.
    acc:        Vec<f32>,
    /// Ranks that contributed to the current round.
    arrived:    usize,
    /// Bumped each time a round completes; waiters compare against it.
    generation: u64,
    /// The last completed sum, read by the waiters of that round.
    result:     Vec<f32>,
    aborted:    bool,
}

/// Ranks are threads of one process.
#[derive(Debug)]
pub struct InProcessGroup {
    world_size: usize,
    round:      Mutex<Round>,
    done:       Condvar,
}

impl InProcessGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size: world_size.max(1),
            round:      Mutex::new(Round::default()),
            done:       Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Round>> {
        self.round.lock().map_err(|_| anyhow!("reduction state poisoned"))
    }
}

impl Collective for InProcessGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, rank: usize, values: Vec<f32>) -> Result<Vec<f32>> {
        if rank >= self.world_size {
            bail!("rank {rank} is outside a group of {}", self.world_size);
        }
        let mut round = self.lock()?;
        if round.aborted {
            return Err(GroupAborted.into());
        }

        if round.arrived == 0 {
            round.acc = values;
        } else if round.acc.len() != values.len() {
            let expected = round.acc.len();
            round.aborted = true;
            self.done.notify_all();
            bail!("rank {rank} reduced {} values, other ranks {expected}", values.len());
        } else {
            for (a, v) in round.acc.iter_mut().zip(values) {
                *a += v;
            }
        }
        round.arrived += 1;

        if round.arrived == self.world_size {
            round.result     = std::mem::take(&mut round.acc);
            round.arrived    = 0;
            round.generation = round.generation.wrapping_add(1);
            self.done.notify_all();
            return Ok(round.result.clone());
        }

        let generation = round.generation;
        let round = self
            .done
            .wait_while(round, |r| r.generation == generation && !r.aborted)
            .map_err(|_| anyhow!("reduction state poisoned"))?;
        if round.generation == generation {
            return Err(GroupAborted.into());
        }
        Ok(round.result.clone())
    }

    fn abort(&self) {
        // a poisoned lock still carries the flag
        let mut round = match self.round.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        round.aborted = true;
        self.done.notify_all();
    }
}

// ─── Distributed ──────────────────────────────────────────────────────────────
pub struct DistributedExecutor {
    rank:       usize,
    device_ids: Vec<usize>,
    collective: Arc<dyn Collective>,
}

impl DistributedExecutor {
    pub fn new(rank: usize, collective: Arc<dyn Collective>) -> Result<Self> {
        if rank >= collective.world_size() {
            bail!("rank {rank} is outside a world of {}", collective.world_size());
        }
        Ok(Self { rank, device_ids: vec![rank], collective })
    }
}

impl<B: Backend> Executor<B> for DistributedExecutor {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    fn broadcast(&self, params: &mut ParamStore<B>) -> Result<()> {
        // rank 0 contributes its values, everyone else zeros
        let names: Vec<String> = params.iter().map(|(n, _)| n.clone()).collect();
        let mut buffer = Vec::with_capacity(params.numel(false));
        for name in &names {
            let values = params.to_vec(name)?;
            if self.rank == 0 {
                buffer.extend(values);
            } else {
                buffer.extend(std::iter::repeat(0.0).take(values.len()));
            }
        }

        let reduced = self.collective.all_reduce_sum(self.rank, buffer)?;
        let mut offset = 0;
        for name in &names {
            let numel = params.get(name).map_or(0, |p| p.numel());
            let value = Tensor::<B, 1>::from_data(
                TensorData::new(reduced[offset..offset + numel].to_vec(), [numel]),
                params.device(),
            );
            params.set_value(name, value)?;
            offset += numel;
        }
        Ok(())
    }

    fn synchronize(&self, params: &ParamStore<B>, grads: &mut GradientSet<B>) -> Result<()> {
        // Same order on every rank: trainable names are sorted.
        let names = params.trainable_names();
        let mut sizes  = Vec::with_capacity(names.len());
        let mut buffer = Vec::new();
        for name in &names {
            let numel = params.get(name).map_or(0, |p| p.numel());
            match grads.get(name) {
                Some(g) => buffer.extend(
                    g.clone()
                        .into_data()
                        .to_vec::<f32>()
                        .map_err(|e| anyhow!("cannot read gradient {name}: {e:?}"))?,
                ),
                None => buffer.extend(std::iter::repeat(0.0).take(numel)),
            }
            sizes.push(numel);
        }
        // one presence flag per parameter after the values
        buffer.extend(names.iter().map(|n| if grads.get(n).is_some() { 1.0 } else { 0.0 }));

        let reduced = self.collective.all_reduce_sum(self.rank, buffer)?;
        let world   = self.collective.world_size() as f32;
        let flags   = &reduced[reduced.len() - names.len()..];
        let device  = params.device();

        let mut offset = 0;
        for ((name, numel), &present) in names.iter().zip(sizes).zip(flags) {
            let slice = &reduced[offset..offset + numel];
            offset += numel;
            if present == 0.0 {
                continue;
            }
            let mean: Vec<f32> = slice.iter().map(|v| v / world).collect();
            grads.grads.insert(
                name.clone(),
                Tensor::<B, 1>::from_data(TensorData::new(mean, [numel]), device),
            );
        }
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_all_reduce_sums_across_threads() {
        let group = InProcessGroup::new(3);
        let results: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    let group = Arc::clone(&group);
                    s.spawn(move || {
                        // two rounds to exercise the reset between them
                        let first = group.all_reduce_sum(rank, vec![rank as f32, 1.0]).unwrap();
                        let second = group.all_reduce_sum(rank, vec![1.0]).unwrap();
                        assert_eq!(second, vec![3.0]);
                        first
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![3.0, 3.0]);
        }
    }

    #[test]
    fn test_synchronize_averages_and_fills_missing() {
        let group = InProcessGroup::new(2);
        let grads: Vec<GradientSet<TestBackend>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let collective: Arc<dyn Collective> = group.clone();
                    s.spawn(move || {
                        let device = Default::default();
                        let mut store = ParamStore::<TestBackend>::new(device);
                        store.insert("a", Tensor::<TestBackend, 1>::zeros([2], &device));
                        store.insert("b", Tensor::<TestBackend, 1>::zeros([1], &device));
                        store.insert("c", Tensor::<TestBackend, 1>::zeros([1], &device));

                        let mut grads = GradientSet::new();
                        let g = if rank == 0 { vec![2.0f32, 4.0] } else { vec![0.0, 2.0] };
                        grads.grads.insert("a".into(), Tensor::from_data(TensorData::new(g, [2]), &device));
                        if rank == 1 {
                            grads.grads.insert("b".into(), Tensor::from_data(TensorData::new(vec![6.0f32], [1]), &device));
                        }
                        let exec = DistributedExecutor::new(rank, collective).unwrap();
                        Executor::<TestBackend>::synchronize(&exec, &store, &mut grads).unwrap();
                        grads
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for g in grads {
            assert_eq!(g.get("a").unwrap().clone().into_data().to_vec::<f32>().unwrap(), vec![1.0, 3.0]);
            assert_eq!(g.get("b").unwrap().clone().into_data().to_vec::<f32>().unwrap(), vec![3.0]);
            assert!(g.get("c").is_none());
        }
    }

    #[test]
    fn test_broadcast_copies_rank_zero() {
        let group = InProcessGroup::new(2);
        let values: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let collective: Arc<dyn Collective> = group.clone();
                    s.spawn(move || {
                        let device = Default::default();
                        let mut store = ParamStore::<TestBackend>::new(device);
                        store.insert("w", Tensor::<TestBackend, 2>::full([2, 2], rank as f32 + 1.0, &device));
                        let exec = DistributedExecutor::new(rank, collective).unwrap();
                        Executor::<TestBackend>::broadcast(&exec, &mut store).unwrap();
                        store.to_vec("w").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(values, vec![vec![1.0; 4], vec![1.0; 4]]);
    }

    #[test]
    fn test_abort_releases_a_waiting_rank() {
        let group = InProcessGroup::new(2);
        let waiter = {
            let group = Arc::clone(&group);
            std::thread::spawn(move || group.all_reduce_sum(0, vec![1.0]))
        };
        // rank 1 never reduces; it fails and tears the group down
        std::thread::sleep(std::time::Duration::from_millis(50));
        group.abort();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.downcast_ref::<GroupAborted>().is_some());
        assert!(group.all_reduce_sum(1, vec![1.0]).unwrap_err().is::<GroupAborted>());
    }

    #[test]
    fn test_length_mismatch_fails_both_ranks() {
        let group = InProcessGroup::new(2);
        let errors: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let group = Arc::clone(&group);
                    s.spawn(move || group.all_reduce_sum(rank, vec![0.0; rank + 1]).is_err())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(errors, vec![true, true]);
    }

    #[test]
    fn test_local_executor_is_primary() {
        let exec = LocalExecutor::new(2);
        assert!(Executor::<TestBackend>::is_primary(&exec));
        assert!(!Executor::<TestBackend>::is_distributed(&exec));
        assert_eq!(Executor::<TestBackend>::device_ids(&exec), &[0, 1]);
    }
}
