// ============================================================
// Layer 4 — Data Sources
// ============================================================
// Implements the DataSource contract two ways:
//
//   ShardedLoader — wraps any Burn Dataset<PairSample>.
//                   Each epoch the indices are shuffled with
//                   seed + epoch, padded to a multiple of the
//                   world size, and rank r takes every r-th
//                   index. Every rank therefore sees the same
//                   number of batches, which keeps the
//                   gradient barrier in lock-step.
//
//   MemorySource  — a fixed list of sample batches.
//
// build_dataloaders() applies the run's split rules: which
// split is "main", whether an eval split exists, and which
// gold file the report path should read.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::data::dataset::PairDataset;
use crate::domain::config::Config;
use crate::domain::sample::PairSample;
use crate::domain::traits::DataSource;

pub struct ShardedLoader<D> {
    dataset:    D,
    batch_size: usize,
    shuffle:    bool,
    seed:       u64,
    epoch:      usize,
    rank:       usize,
    world_size: usize,
}

impl<D: Dataset<PairSample>> ShardedLoader<D> {
    pub fn new(dataset: D, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle:    false,
            seed:       0,
            epoch:      0,
            rank:       0,
            world_size: 1,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed    = seed;
        self
    }

    pub fn sharded(mut self, rank: usize, world_size: usize) -> Self {
        self.rank       = rank;
        self.world_size = world_size.max(1);
        self
    }

    /// Indices this rank visits in the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        let total = self.dataset.len();
        let mut order: Vec<usize> = (0..total).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            order.shuffle(&mut rng);
        }
        if self.world_size == 1 || total == 0 {
            return order;
        }
        // Pad by wrapping so every rank gets the same count
        let per_rank = total.div_ceil(self.world_size);
        let padded   = per_rank * self.world_size;
        for i in 0..(padded - total) {
            order.push(order[i % total]);
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

impl<D: Dataset<PairSample>> DataSource for ShardedLoader<D> {
    fn len(&self) -> usize {
        let total = self.dataset.len();
        let per_rank = if self.world_size == 1 { total } else { total.div_ceil(self.world_size) };
        per_rank.div_ceil(self.batch_size)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Vec<PairSample>>> + '_> {
        let indices = self.indices();
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            chunk
                .iter()
                .map(|&i| {
                    self.dataset
                        .get(i)
                        .with_context(|| format!("dataset index {i} out of range"))
                })
                .collect::<Result<Vec<_>>>()
        }))
    }
}

/// Batches fixed up front; `set_epoch` does nothing.
pub struct MemorySource {
    batches: Vec<Vec<PairSample>>,
}

impl MemorySource {
    pub fn new(batches: Vec<Vec<PairSample>>) -> Self {
        Self { batches }
    }
}

impl DataSource for MemorySource {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn set_epoch(&mut self, _epoch: usize) {}

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Vec<PairSample>>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// Everything the monitor needs to know about its data.
pub struct DataSplits {
    /// Split the main loader reads; `eval_name` in eval mode
    pub main_name: String,
    pub main:      Box<dyn DataSource>,
    /// Held-out split evaluated during training, when on disk
    pub eval:      Option<Box<dyn DataSource>>,
    /// Gold labels for whichever split gets reported
    pub gold_file: PathBuf,
}

/// Build the main loader and, when the split exists, the eval loader.
pub fn build_dataloaders(cfg: &Config) -> Result<DataSplits> {
    let rcfg      = &cfg.running;
    let main_name = if cfg.eval { rcfg.eval_name.clone() } else { rcfg.data_name.clone() };

    let main_set = PairDataset::from_jsonl(cfg.split_path(&format!("{main_name}.jsonl")))?;
    let mut main = ShardedLoader::new(main_set, rcfg.batch_size).sharded(cfg.rank, cfg.world_size);
    if !cfg.eval {
        main = main.shuffled(cfg.seed);
    }
    let mut gold_file = cfg.gold_file(&main_name);

    let mut eval: Option<Box<dyn DataSource>> = None;
    if !cfg.eval {
        let eval_name = &rcfg.eval_name;
        let has_eval  = cfg.split_path(eval_name).is_dir() || cfg.gold_file(eval_name).is_file();
        if has_eval {
            let eval_set = PairDataset::from_jsonl(cfg.split_path(&format!("{eval_name}.jsonl")))?;
            eval = Some(Box::new(
                ShardedLoader::new(eval_set, rcfg.batch_size).sharded(cfg.rank, cfg.world_size),
            ));
            gold_file = cfg.gold_file(eval_name);
        }
    }

    Ok(DataSplits { main_name, main: Box::new(main), eval, gold_file })
}
