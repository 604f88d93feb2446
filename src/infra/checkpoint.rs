// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// One bincode envelope per save:
//
//   Checkpoint {
//       version,       format version, checked on load
//       step,          optimizer step the snapshot was taken at
//       config_json,   the full run configuration
//       heads,         sub-head name → Burn module record bytes
//   }
//
// File naming convention:
//   <alias_root>/<model_name>/
//     00001000.ckpt   ← after step 1000
//     00002000.ckpt   ← after step 2000
//
// Within a run checkpoints are append-only: saving a step twice
// is refused. Files left in the directory by an earlier run are
// overwritten with a warning. Sub-heads restore independently,
// so a reader may take only the heads it wants.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::config::Config;

pub const CHECKPOINT_VERSION: u32 = 3;
pub const CHECKPOINT_EXT: &str = "ckpt";

/// One sub-head as written by Burn's `NamedMpkBytesRecorder`.
pub type HeadRecord = Vec<u8>;

/// Sub-head name → record.
pub type HeadStates = BTreeMap<String, HeadRecord>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("checkpoint has no sub-head `{0}`")]
    MissingHead(String),

    #[error("model has no sub-head `{0}`")]
    UnknownHead(String),

    #[error("model has no parameter `{0}`")]
    UnknownParameter(String),

    #[error("parameter `{name}` has shape {expected:?} but the checkpoint holds {found:?}")]
    ShapeMismatch {
        name:     String,
        expected: Vec<usize>,
        found:    Vec<usize>,
    },

    #[error("refusing to overwrite checkpoint '{0}' written earlier in this run")]
    Exists(PathBuf),

    #[error("cannot decode sub-head record: {0}")]
    Record(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version:     u32,
    pub step:        usize,
    pub config_json: String,
    pub heads:       HeadStates,
}

impl Checkpoint {
    pub fn new(step: usize, cfg: &Config, heads: HeadStates) -> Result<Self> {
        Ok(Self {
            version:     CHECKPOINT_VERSION,
            step,
            config_json: cfg.to_json()?,
            heads,
        })
    }

    pub fn config(&self) -> Result<Config> {
        serde_json::from_str(&self.config_json).context("Checkpoint holds an unreadable config")
    }

    pub fn head(&self, name: &str) -> Result<&HeadRecord, CheckpointError> {
        self.heads.get(name).ok_or_else(|| CheckpointError::MissingHead(name.to_string()))
    }

    /// Read a checkpoint written by `CheckpointManager::save`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Cannot open checkpoint '{}'", path.display()))?;
        let ckpt: Checkpoint = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("Cannot decode checkpoint '{}'", path.display()))?;
        if ckpt.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                found:    ckpt.version,
                expected: CHECKPOINT_VERSION,
            }
            .into());
        }
        Ok(ckpt)
    }
}

/// Writes checkpoints for one run into `<alias_root>/<model_name>`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir:     PathBuf,
    written: BTreeSet<PathBuf>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), written: BTreeSet::new() }
    }

    pub fn for_run(cfg: &Config) -> Self {
        Self::new(cfg.run_dir())
    }

    /// `<dir>/<step:08>.ckpt`
    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{step:08}.{CHECKPOINT_EXT}"))
    }

    pub fn save(&mut self, ckpt: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create checkpoint dir '{}'", self.dir.display()))?;
        let path = self.path_for(ckpt.step);
        if self.written.contains(&path) {
            return Err(CheckpointError::Exists(path).into());
        }
        if path.exists() {
            tracing::warn!("Overwriting '{}' left by an earlier run", path.display());
        }
        let file = File::create(&path)
            .with_context(|| format!("Cannot create checkpoint '{}'", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), ckpt)
            .with_context(|| format!("Failed to write checkpoint '{}'", path.display()))?;
        tracing::debug!("Saved checkpoint at step {}", ckpt.step);
        self.written.insert(path.clone());
        Ok(path)
    }

    /// Steps with a checkpoint on disk, ascending.
    pub fn saved_steps(&self) -> Result<Vec<usize>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut steps = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            if let Some(step) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }
}
