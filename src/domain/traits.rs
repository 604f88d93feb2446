// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The loop is written against these contracts only:
//
//   DataSource — an epoch-able iterable of sample batches with a
//                known length and a per-epoch shuffle seed
//   Echo       — the injected logging sink
//
// The model contract lives in Layer 5 because it speaks in
// tensors; everything here is framework-free.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::domain::sample::PairSample;

// ─── DataSource ───────────────────────────────────────────────────────────────
/// Anything that can produce batches for one epoch at a time.
///
/// Implementations:
///   - ShardedLoader  → a Burn dataset, shuffled and sharded per rank
///   - MemorySource   → fixed batches held in memory
pub trait DataSource: Send {
    /// Number of batches one epoch yields on this rank.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reseed the shuffle for `epoch`; a no-op for unshuffled sources.
    fn set_epoch(&mut self, epoch: usize);

    /// Iterate the current epoch, one batch of samples at a time.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Vec<PairSample>>> + '_>;
}

// ─── Echo ─────────────────────────────────────────────────────────────────────
/// Cheap to clone; safe to call every few hundred steps.
#[derive(Clone)]
pub struct Echo {
    sink: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Echo {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    /// Forward every line to `tracing` at info level, tagged with the rank.
    pub fn tracing(rank: usize) -> Self {
        Self::new(move |msg| tracing::info!(rank, "{}", msg))
    }

    pub fn say(&self, msg: impl AsRef<str>) {
        (self.sink)(msg.as_ref());
    }
}

impl fmt::Debug for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Echo")
    }
}
