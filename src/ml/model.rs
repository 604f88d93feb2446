// ============================================================
// Layer 5 — Model Contract
// ============================================================
// What the monitor needs from a model, and nothing more:
//
//   build()        → names of the tunable parameters
//   forward(...)   → scalar loss (training), or None when the
//                    model only accumulated predictions
//   report(gold)   → one human-readable evaluation summary
//   export / import of per-head Burn records for checkpoints
//
// Weights live in the model's ParamStore. The monitor lifts
// them into autodiff leaves every step, hands the leaves to
// `forward`, and writes the optimizer's updates back.

use std::path::Path;

use anyhow::Result;
use burn::tensor::{backend::AutodiffBackend, Tensor};

use crate::data::batcher::Batch;
use crate::infra::checkpoint::{CheckpointError, HeadRecord, HeadStates};
use crate::ml::params::{Leaves, ParamStore, TunableSet};

/// Per-call context the loop passes to `forward`.
#[derive(Debug, Clone, Copy)]
pub struct ForwardArgs<'a> {
    pub device_ids: &'a [usize],
    /// Sample ids; only set on evaluation passes.
    pub names:      Option<&'a [String]>,
}

pub trait Model<B: AutodiffBackend>: Send {
    /// Load any pretrained state and declare what may be trained.
    fn build(&mut self) -> Result<TunableSet>;

    fn params(&self) -> &ParamStore<B::InnerBackend>;

    fn params_mut(&mut self) -> &mut ParamStore<B::InnerBackend>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn forward(
        &mut self,
        leaves: &Leaves<B>,
        batch:  &Batch<B>,
        args:   ForwardArgs<'_>,
    ) -> Result<Option<Tensor<B, 1>>>;

    /// Summarise everything accumulated since the last report.
    fn report(&mut self, gold_file: &Path) -> Result<String>;

    /// Sub-heads written into periodic checkpoints.
    fn checkpoint_heads(&self) -> Vec<&'static str>;

    fn export_head(&self, head: &str) -> Result<HeadRecord>;

    fn import_head(&mut self, head: &str, record: &HeadRecord) -> Result<(), CheckpointError>;

    fn export_heads(&self, heads: &[&str]) -> Result<HeadStates> {
        heads
            .iter()
            .map(|&h| Ok((h.to_string(), self.export_head(h)?)))
            .collect()
    }

    /// Restore the heads in `states`, or only those named in `only`.
    /// Each head restores independently of the others.
    fn import_heads(&mut self, states: &HeadStates, only: Option<&[&str]>) -> Result<(), CheckpointError> {
        if let Some(keep) = only {
            if let Some(missing) = keep.iter().find(|h| !states.contains_key(**h)) {
                return Err(CheckpointError::MissingHead(missing.to_string()));
            }
        }
        for (head, record) in states {
            if only.is_some_and(|keep| !keep.contains(&head.as_str())) {
                continue;
            }
            self.import_head(head, record)?;
        }
        Ok(())
    }
}
