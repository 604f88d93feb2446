// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Three subcommands share one set of flags:
//
//   train — run the configured epochs
//   eval  — one pass over the eval split with a saved model
//   norms — per-channel audio mean/std over the training split
//
// Every flag is optional and overrides the matching field of
// the JSON config; absent flags leave the file's value alone.
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use crate::application::run_use_case::DeviceKind;
use crate::domain::config::Config;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the audio head against the frozen image head
    Train(RunArgs),

    /// Evaluate a saved model on the eval split
    Eval(RunArgs),

    /// Compute audio normalisation statistics
    Norms(RunArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceArg {
    Cpu,
    Gpu,
}

impl From<DeviceArg> for DeviceKind {
    fn from(d: DeviceArg) -> Self {
        match d {
            DeviceArg::Cpu => DeviceKind::Cpu,
            DeviceArg::Gpu => DeviceKind::Gpu,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON configuration; built-in defaults when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding `<split>.jsonl` and `<split>.csv`
    #[arg(long)]
    pub data_root: Option<String>,

    /// Root under which every run gets its own directory
    #[arg(long)]
    pub alias_root: Option<String>,

    /// Run name; checkpoints go to `<alias_root>/<model_name>/`
    #[arg(long)]
    pub model_name: Option<String>,

    /// Checkpoint to evaluate
    #[arg(long)]
    pub model_file: Option<String>,

    /// Checkpoint whose image and loss heads seed training
    #[arg(long)]
    pub pretrained: Option<String>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of data-parallel ranks
    #[arg(long)]
    pub world_size: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// List every tunable parameter at startup
    #[arg(long)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = DeviceArg::Gpu)]
    pub device: DeviceArg,
}

impl RunArgs {
    /// Load the config file (if any) and apply the flags on top.
    pub fn resolve(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None       => Config::default(),
        };
        if let Some(v) = &self.data_root  { cfg.running.data_root = v.clone(); }
        if let Some(v) = &self.alias_root { cfg.alias_root = v.clone(); }
        if let Some(v) = &self.model_name { cfg.model_name = v.clone(); }
        if let Some(v) = &self.model_file { cfg.model_file = Some(v.clone()); }
        if let Some(v) = &self.pretrained { cfg.model.pretrained = Some(v.clone()); }
        if let Some(v) = self.epochs      { cfg.optimizer.epochs = v; }
        if let Some(v) = self.batch_size  { cfg.running.batch_size = v; }
        if let Some(v) = self.world_size  { cfg.world_size = v; }
        if let Some(v) = self.seed        { cfg.seed = v; }
        cfg.verbose |= self.verbose;
        Ok(cfg)
    }
}
