// ============================================================
// Layer 3 — Raw Samples and Batches
// ============================================================
// A data source hands the loop plain arrays. Each batch has
// three aligned columns:
//
//   images  (B, C, H, W) pixels, or (B, D) pre-computed features
//   audios  (B, F, T)    single-channel spectrograms
//   ids     B sample identifiers
//
// Batches are consumed once and dropped; the loop keeps
// nothing from a batch past the current step.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A dense row-major f32 array with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArray {
    pub shape:  Vec<usize>,
    pub values: Vec<f32>,
}

impl RawArray {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            bail!("shape {:?} holds {} values, got {}", shape, numel, values.len());
        }
        Ok(Self { shape, values })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self { shape, values: vec![0.0; numel] }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// Stack equally shaped arrays along a new leading axis.
    pub fn stack(items: &[&RawArray]) -> Result<RawArray> {
        let Some(first) = items.first() else {
            bail!("cannot stack an empty list of arrays");
        };
        let mut values = Vec::with_capacity(first.numel() * items.len());
        for item in items {
            if item.shape != first.shape {
                bail!("cannot stack shape {:?} with {:?}", item.shape, first.shape);
            }
            values.extend_from_slice(&item.values);
        }
        let mut shape = Vec::with_capacity(first.rank() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);
        Ok(RawArray { shape, values })
    }
}

/// One image/audio pair as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSample {
    pub id:    String,
    pub image: RawArray,
    pub audio: RawArray,
}

/// Three aligned columns; the leading axis of both arrays is the batch.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub images: RawArray,
    pub audios: RawArray,
    pub ids:    Vec<String>,
}

impl RawBatch {
    pub fn collate(samples: &[PairSample]) -> Result<Self> {
        let images: Vec<&RawArray> = samples.iter().map(|s| &s.image).collect();
        let audios: Vec<&RawArray> = samples.iter().map(|s| &s.audio).collect();
        Ok(Self {
            images: RawArray::stack(&images)?,
            audios: RawArray::stack(&audios)?,
            ids:    samples.iter().map(|s| s.id.clone()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
