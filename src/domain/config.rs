// ============================================================
// Layer 3 — Run Configuration
// ============================================================
// One hierarchical record read once at startup:
//
//   Config
//     ├── running    data locations, cadences, resolution
//     ├── optimizer  epochs, warmup, LARS, named optimizer
//     │              and scheduler with keyword parameters
//     └── model      head dimensions and loss settings
//
// Every field carries a serde default so a partial JSON file
// is a valid configuration. The monitor only ever changes one
// derived value: the effective peep rate, clamped to the
// number of batches in an epoch.

use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration problems, all raised before the first step.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown optimizer `{0}`")]
    UnknownOptimizer(String),

    #[error("unknown scheduler `{0}`")]
    UnknownScheduler(String),

    #[error("invalid parameters for `{name}`: {source}")]
    InvalidParams {
        name:   String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field:  &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// One evaluation pass over the eval split instead of training
    pub eval:        bool,
    /// List every tunable parameter at startup
    pub verbose:     bool,
    /// This process's rank; set per worker, never read from the file
    pub rank:        usize,
    /// Devices driven by a single-rank run
    pub num_gpus:    usize,
    /// Number of ranks taking part in the run
    pub world_size:  usize,
    /// Seeds parameter init and the per-epoch shuffle
    pub seed:        u64,
    /// Parent of every run directory
    pub alias_root:  String,
    /// Run directory name under `alias_root`
    pub model_name:  String,
    /// Checkpoint restored when `eval` is set
    pub model_file:  Option<String>,
    /// Data, cadence and input settings
    pub running:     RunningConfig,
    /// Optimizer, scheduler and warm-up
    pub optimizer:   OptimizerSection,
    /// Head dimensions and loss settings
    pub model:       ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eval:       false,
            verbose:    false,
            rank:       0,
            num_gpus:   1,
            world_size: 1,
            seed:       42,
            alias_root: "runs".to_string(),
            model_name: "cvap".to_string(),
            model_file: None,
            running:    RunningConfig::default(),
            optimizer:  OptimizerSection::default(),
            model:      ModelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunningConfig {
    /// Directory holding `<split>.jsonl` and `<split>.csv`
    pub data_root:    String,
    /// Training split
    pub data_name:    String,
    /// Evaluation split; evaluated only when present on disk
    pub eval_name:    String,
    /// Per rank
    pub batch_size:   usize,
    /// Log every `peep_rate` steps
    pub peep_rate:    usize,
    /// Evaluate and checkpoint every `save_rate` steps
    pub save_rate:    usize,
    /// Also evaluate at every epoch boundary
    pub save_epoch:   bool,
    /// Upper bound on evaluated samples; `None` means the whole split
    pub eval_samples: Option<usize>,
    /// Skip the evaluation pass (not the checkpoint) while the step
    /// loss is at or above this value; `None` always evaluates
    pub eval_loss_ceiling: Option<f64>,
    /// Target spatial size for image batches
    pub resolution:   usize,
    /// Loss scaling for mixed-precision backends
    pub amp:          bool,
    /// Audio-only modes
    pub audio:        AudioRunning,
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            data_root:    "data".to_string(),
            data_name:    "train".to_string(),
            eval_name:    "eval".to_string(),
            batch_size:   32,
            peep_rate:    100,
            save_rate:    1000,
            save_epoch:   false,
            eval_samples: None,
            eval_loss_ceiling: None,
            resolution:   224,
            amp:          true,
            audio:        AudioRunning::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioRunning {
    /// Only compute mean / std of the audio input, then stop
    pub eval_norms: bool,
}

/// A component selected by name, with keyword parameters
/// passed through verbatim to its constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSpec {
    /// Constructor name, matched exactly
    pub name:   String,
    /// Keyword parameters; an empty object when omitted
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl NamedSpec {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self { name: name.into(), params }
    }

    /// Deserialize the keyword parameters into a typed struct.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(self.params.clone()).map_err(|source| ConfigError::InvalidParams {
            name: self.name.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSection {
    /// Passes over the training split
    pub epochs:                usize,
    /// Linear ramp of every group's rate over `warmup_steps`
    pub warmup:                bool,
    /// Length of the warm-up ramp in steps
    pub warmup_steps:          usize,
    /// LARS replaces both the named optimizer's rates and the scheduler
    pub use_lars:              bool,
    /// Step the scheduler per batch instead of per epoch
    pub batch_sch:             bool,
    /// Weight decay under LARS; otherwise the optimizer's own parameter
    pub weight_decay:          f64,
    /// LARS base rate of the weight group
    pub learning_rate_weights: f64,
    /// LARS base rate of the bias group
    pub learning_rate_biases:  f64,
    /// Global gradient-norm clip; 0 disables clipping
    pub max_norm:              f64,
    /// `SGD`, `Adam` or `AdamW` with keyword parameters
    pub optimizer:             NamedSpec,
    /// Schedule by name; ignored under LARS
    pub scheduler:             NamedSpec,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            epochs:                10,
            warmup:                false,
            warmup_steps:          1000,
            use_lars:              false,
            batch_sch:             false,
            weight_decay:          1e-6,
            learning_rate_weights: 0.2,
            learning_rate_biases:  0.0048,
            max_norm:              0.0,
            optimizer: NamedSpec::new("Adam", serde_json::json!({ "lr": 1e-4 })),
            scheduler: NamedSpec::new(
                "MultiStepLR",
                serde_json::json!({ "milestones": [10], "gamma": 0.5 }),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of the shared embedding space
    pub embed_dim:  usize,
    /// Checkpoint whose image and loss heads seed a new run
    pub pretrained: Option<String>,
    /// Image projection head
    pub image:      ImageHeadConfig,
    /// Audio projection head
    pub audio:      AudioHeadConfig,
    /// Label embedding and temperature
    pub loss:       LossHeadConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_dim:  512,
            pretrained: None,
            image:      ImageHeadConfig::default(),
            audio:      AudioHeadConfig::default(),
            loss:       LossHeadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageHeadConfig {
    /// Channels of pixel input, or width of pre-computed features
    pub input_dim: usize,
}

impl Default for ImageHeadConfig {
    fn default() -> Self {
        Self { input_dim: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioHeadConfig {
    /// Width of one audio frame, the audio head's input size
    pub num_mel_bins: usize,
}

impl Default for AudioHeadConfig {
    fn default() -> Self {
        Self { num_mel_bins: 128 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossHeadConfig {
    /// Size of the label set; gold indices must be below it
    pub num_labels:       usize,
    /// Log of the initial inverse temperature
    pub init_logit_scale: f32,
}

impl Default for LossHeadConfig {
    fn default() -> Self {
        Self {
            num_labels:       527,
            init_logit_scale: (1.0f32 / 0.07).ln(),
        }
    }
}

impl Config {
    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config from '{}'", path.display()))?;
        let cfg: Config = serde_json::from_str(&json)
            .with_context(|| format!("Cannot parse config '{}'", path.display()))?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.running;
        let o = &self.optimizer;
        if r.batch_size == 0 {
            return Err(ConfigError::invalid("running.batch_size", "must be positive"));
        }
        if r.peep_rate == 0 {
            return Err(ConfigError::invalid("running.peep_rate", "must be positive"));
        }
        if r.save_rate == 0 {
            return Err(ConfigError::invalid("running.save_rate", "must be positive"));
        }
        if r.eval_loss_ceiling.is_some_and(|c| !c.is_finite() || c <= 0.0) {
            return Err(ConfigError::invalid("running.eval_loss_ceiling", "must be a positive number"));
        }
        if r.resolution == 0 {
            return Err(ConfigError::invalid("running.resolution", "must be positive"));
        }
        if o.epochs == 0 && !self.eval {
            return Err(ConfigError::invalid("optimizer.epochs", "must be positive"));
        }
        if o.warmup && o.warmup_steps == 0 {
            return Err(ConfigError::invalid("optimizer.warmup_steps", "must be positive when warmup is on"));
        }
        if o.max_norm < 0.0 {
            return Err(ConfigError::invalid("optimizer.max_norm", "must not be negative"));
        }
        if self.world_size == 0 {
            return Err(ConfigError::invalid("world_size", "must be at least 1"));
        }
        if self.rank >= self.world_size {
            return Err(ConfigError::invalid(
                "rank",
                format!("{} is outside a world of {}", self.rank, self.world_size),
            ));
        }
        if self.model.embed_dim == 0 {
            return Err(ConfigError::invalid("model.embed_dim", "must be positive"));
        }
        if self.eval && self.model_file.is_none() && !r.audio.eval_norms {
            return Err(ConfigError::invalid("model_file", "required in eval mode"));
        }
        Ok(())
    }

    /// `<data_root>/<split>`
    pub fn split_path(&self, split: &str) -> PathBuf {
        Path::new(&self.running.data_root).join(split)
    }

    /// `<data_root>/<split>.csv`
    pub fn gold_file(&self, split: &str) -> PathBuf {
        Path::new(&self.running.data_root).join(format!("{split}.csv"))
    }

    /// `<alias_root>/<model_name>`
    pub fn run_dir(&self) -> PathBuf {
        Path::new(&self.alias_root).join(&self.model_name)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{ "model_name": "cvap-small", "running": { "peep_rate": 7 } }"#,
        ).unwrap();
        assert_eq!(cfg.model_name, "cvap-small");
        assert_eq!(cfg.running.peep_rate, 7);
        assert_eq!(cfg.running.save_rate, 1000);
        assert_eq!(cfg.optimizer.optimizer.name, "Adam");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_written_config_reads_back() {
        let mut cfg = Config::default();
        cfg.optimizer.warmup_steps     = 50;
        cfg.optimizer.weight_decay     = 0.01;
        cfg.model.audio.num_mel_bins   = 64;
        cfg.optimizer.scheduler        = NamedSpec::new("StepLR", serde_json::json!({ "step_size": 3 }));
        let back: Config = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back.optimizer.warmup_steps, 50);
        assert_eq!(back.optimizer.weight_decay, 0.01);
        assert_eq!(back.model.audio.num_mel_bins, 64);
        assert_eq!(back.optimizer.scheduler.name, "StepLR");
        assert_eq!(back.optimizer.scheduler.params, serde_json::json!({ "step_size": 3 }));
    }

    #[test]
    fn test_zero_rates_rejected() {
        let mut cfg = Config::default();
        cfg.running.peep_rate = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "running.peep_rate", .. })
        ));
    }

    #[test]
    fn test_eval_requires_model_file() {
        let mut cfg = Config { eval: true, ..Config::default() };
        assert!(cfg.validate().is_err());
        cfg.model_file = Some("runs/cvap/00000010.ckpt".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rank_outside_world() {
        let cfg = Config { rank: 2, world_size: 2, ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_named_params_are_typed() {
        #[derive(Deserialize)]
        struct Step { step_size: usize }
        let spec = NamedSpec::new("StepLR", serde_json::json!({ "step_size": "ten" }));
        assert!(matches!(spec.params::<Step>(), Err(ConfigError::InvalidParams { .. })));
        let spec = NamedSpec::new("StepLR", serde_json::json!({ "step_size": 10 }));
        assert_eq!(spec.params::<Step>().unwrap().step_size, 10);
    }

    #[test]
    fn test_paths() {
        let cfg = Config::default();
        assert_eq!(cfg.gold_file("eval"), PathBuf::from("data/eval.csv"));
        assert_eq!(cfg.run_dir(), PathBuf::from("runs/cvap"));
    }
}
