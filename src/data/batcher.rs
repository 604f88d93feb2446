// ============================================================
// Layer 4 — Batch Pipeline
// ============================================================
// Implements Burn's Batcher trait: a Vec<PairSample> is
// collated into aligned columns, then turned into device
// tensors the model can consume.
//
//   images: rank 2  (B, D)       → features, passed through
//           rank 4  (B, C, H, W) → pixels; bilinear resize to
//                                  (resolution, resolution) when
//                                  the spatial size differs
//   audios: rank 3  (B, F, T)    → (B, 1, F, T)
//           rank 4  (B, 1, F, T) → passed through
//
// The resize samples at half-pixel centres (align_corners off),
// one spatial axis at a time. The pipeline holds only the target
// device and resolution, so the same samples always yield the
// same tensors.
//
// Reference: Burn Book §4 (Batcher)

use anyhow::{bail, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

use crate::domain::sample::{PairSample, RawArray, RawBatch};

/// The primary modality after normalisation.
#[derive(Debug, Clone)]
pub enum Primary<B: Backend> {
    Pixels(Tensor<B, 4>),
    Features(Tensor<B, 2>),
}

impl<B: Backend> Primary<B> {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Primary::Pixels(t)   => t.dims().to_vec(),
            Primary::Features(t) => t.dims().to_vec(),
        }
    }
}

/// A batch ready for the forward pass.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub images: Primary<B>,
    /// (B, 1, F, T)
    pub audios: Tensor<B, 4>,
    pub ids:    Vec<String>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct BatchPipeline<B: Backend> {
    device:     B::Device,
    resolution: usize,
}

impl<B: Backend> BatchPipeline<B> {
    pub fn new(device: B::Device, resolution: usize) -> Self {
        Self { device, resolution }
    }

    pub fn make_batch(&self, raw: RawBatch) -> Result<Batch<B>> {
        let bsz = raw.len();
        if raw.images.shape.first() != Some(&bsz) || raw.audios.shape.first() != Some(&bsz) {
            bail!(
                "misaligned batch: {} ids, images {:?}, audios {:?}",
                bsz, raw.images.shape, raw.audios.shape
            );
        }
        let images = self.make_images(raw.images)?;
        let audios = self.make_audios(raw.audios)?;
        Ok(Batch { images, audios, ids: raw.ids })
    }

    fn make_images(&self, raw: RawArray) -> Result<Primary<B>> {
        match raw.rank() {
            2 => Ok(Primary::Features(self.tensor::<2>(raw))),
            4 => {
                let images = self.tensor::<4>(raw);
                let [_, _, h, w] = images.dims();
                if w == self.resolution && h == self.resolution {
                    return Ok(Primary::Pixels(images));
                }
                let images = self.resize_axis(images, 2, self.resolution);
                Ok(Primary::Pixels(self.resize_axis(images, 3, self.resolution)))
            }
            r => bail!("images must be (B, D) or (B, C, H, W), got rank {r}"),
        }
    }

    /// Linear interpolation along `dim` of a (B, C, H, W) tensor.
    fn resize_axis(&self, images: Tensor<B, 4>, dim: usize, out: usize) -> Tensor<B, 4> {
        let len = images.dims()[dim];
        if len == out {
            return images;
        }
        let (lo, hi, frac) = source_taps(len, out);
        let lo = Tensor::<B, 1, Int>::from_data(TensorData::new(lo, [out]), &self.device);
        let hi = Tensor::<B, 1, Int>::from_data(TensorData::new(hi, [out]), &self.device);

        let near = images.clone().select(dim, lo);
        let far  = images.select(dim, hi);
        let mut shape = [1usize; 4];
        shape[dim] = out;
        let weight = Tensor::<B, 1>::from_data(TensorData::new(frac, [out]), &self.device)
            .reshape(shape)
            .expand(near.dims());
        near.clone() + (far - near) * weight
    }

    fn make_audios(&self, raw: RawArray) -> Result<Tensor<B, 4>> {
        match raw.rank() {
            3 => Ok(self.tensor::<3>(raw).unsqueeze_dim::<4>(1)),
            4 if raw.shape[1] == 1 => Ok(self.tensor::<4>(raw)),
            _ => bail!("audios must be (B, F, T), got shape {:?}", raw.shape),
        }
    }

    fn tensor<const D: usize>(&self, raw: RawArray) -> Tensor<B, D> {
        Tensor::<B, D>::from_data(TensorData::new(raw.values, raw.shape), &self.device)
    }
}

impl<B: Backend> Batcher<PairSample, Result<Batch<B>>> for BatchPipeline<B> {
    fn batch(&self, items: Vec<PairSample>) -> Result<Batch<B>> {
        self.make_batch(RawBatch::collate(&items)?)
    }
}

/// For each output index: the two source indices it blends and the
/// weight of the second one.
fn source_taps(len: usize, out: usize) -> (Vec<i64>, Vec<i64>, Vec<f32>) {
    let scale = len as f32 / out as f32;
    let mut lo   = Vec::with_capacity(out);
    let mut hi   = Vec::with_capacity(out);
    let mut frac = Vec::with_capacity(out);
    for i in 0..out {
        let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0  = (src.floor() as usize).min(len - 1);
        lo.push(i0 as i64);
        hi.push((i0 + 1).min(len - 1) as i64);
        frac.push(src - i0 as f32);
    }
    (lo, hi, frac)
}
