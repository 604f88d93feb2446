use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;

use crate::domain::sample::PairSample;

/// Image/audio pairs held in memory, one JSON object per line on disk.
pub struct PairDataset {
    samples: Vec<PairSample>,
}

impl PairDataset {
    pub fn new(samples: Vec<PairSample>) -> Self { Self { samples } }

    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Cannot open split '{}'", path.display()))?;
        let mut samples = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: PairSample = serde_json::from_str(&line).with_context(|| {
                format!("Bad record at {}:{}", path.display(), lineno + 1)
            })?;
            samples.push(sample);
        }
        Ok(Self { samples })
    }
}

impl Dataset<PairSample> for PairDataset {
    fn get(&self, index: usize) -> Option<PairSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
