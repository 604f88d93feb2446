// ============================================================
// Layer 5 — Sub-heads as Burn Modules
// ============================================================
// The dual encoder's three sub-heads are Burn modules. They are
// the unit of initialisation and of checkpointing:
//
//   HeadsConfig::init → seeded Linear / Param modules
//   write(Register)   → module parameters into the ParamStore
//                       under `<head>.<field>`
//   encode / decode   → one named MessagePack record per head
//
// Training reads the flat store, not the modules. A module is
// rebuilt from the store whenever it is recorded, and a decoded
// record is written back into the store with its shapes checked.
//
// Reference: Burn Book §3 (Modules), §5 (Records)

use anyhow::{anyhow, Result};
use burn::{
    module::Param,
    nn::{Initializer, Linear, LinearConfig},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
};

use crate::infra::checkpoint::{CheckpointError, HeadRecord};
use crate::ml::params::ParamStore;

// The bincode bytes recorder unwraps its decode; this one reports
// corrupt bytes as a RecorderError.
type HeadRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

#[derive(Config, Debug)]
pub struct HeadsConfig {
    pub image_dim:  usize,
    pub audio_dim:  usize,
    pub embed_dim:  usize,
    pub num_labels: usize,
    #[config(default = 2.6592)]
    pub init_logit_scale: f32,
}

impl HeadsConfig {
    pub fn init_image<B: Backend>(&self, device: &B::Device) -> ProjectionHead<B> {
        ProjectionHead { proj: LinearConfig::new(self.image_dim, self.embed_dim).init(device) }
    }

    pub fn init_audio<B: Backend>(&self, device: &B::Device) -> ProjectionHead<B> {
        ProjectionHead { proj: LinearConfig::new(self.audio_dim, self.embed_dim).init(device) }
    }

    pub fn init_loss<B: Backend>(&self, device: &B::Device) -> LossHead<B> {
        LossHead {
            label_embedding: Initializer::Normal { mean: 0.0, std: 1.0 }
                .init([self.num_labels, self.embed_dim], device),
            logit_scale: Initializer::Constant { value: self.init_logit_scale as f64 }.init([1], device),
        }
    }
}

/// Pooled inputs into the shared embedding space.
#[derive(Module, Debug)]
pub struct ProjectionHead<B: Backend> {
    pub proj: Linear<B>,
}

#[derive(Module, Debug)]
pub struct LossHead<B: Backend> {
    /// (labels, embed)
    pub label_embedding: Param<Tensor<B, 2>>,
    /// Log of the similarity temperature.
    pub logit_scale:     Param<Tensor<B, 1>>,
}

/// How a head's tensors enter the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    /// First registration at model construction.
    Register,
    /// Overwrite an existing parameter of the same shape.
    Restore,
}

/// A module whose parameters live in a [`ParamStore`] under one prefix.
pub trait StoredHead<B: Backend>: Module<B> + Sized {
    fn write(self, head: &str, store: &mut ParamStore<B>, mode: Write) -> Result<(), CheckpointError>;

    /// Rebuild the module from the store's current values.
    fn read(head: &str, store: &ParamStore<B>) -> Result<Self>;
}

impl<B: Backend> StoredHead<B> for ProjectionHead<B> {
    fn write(self, head: &str, store: &mut ParamStore<B>, mode: Write) -> Result<(), CheckpointError> {
        put(store, format!("{head}.weight"), self.proj.weight.val(), mode)?;
        if let Some(bias) = self.proj.bias {
            put(store, format!("{head}.bias"), bias.val(), mode)?;
        }
        Ok(())
    }

    fn read(head: &str, store: &ParamStore<B>) -> Result<Self> {
        let bias = format!("{head}.bias");
        let bias = match store.get(&bias) {
            Some(_) => Some(Param::from_tensor(store.tensor::<1>(&bias)?)),
            None    => None,
        };
        Ok(Self {
            proj: Linear {
                weight: Param::from_tensor(store.tensor::<2>(&format!("{head}.weight"))?),
                bias,
            },
        })
    }
}

impl<B: Backend> StoredHead<B> for LossHead<B> {
    fn write(self, head: &str, store: &mut ParamStore<B>, mode: Write) -> Result<(), CheckpointError> {
        put(store, format!("{head}.label_embedding"), self.label_embedding.val(), mode)?;
        put(store, format!("{head}.logit_scale"), self.logit_scale.val(), mode)
    }

    fn read(head: &str, store: &ParamStore<B>) -> Result<Self> {
        Ok(Self {
            label_embedding: Param::from_tensor(store.tensor::<2>(&format!("{head}.label_embedding"))?),
            logit_scale:     Param::from_tensor(store.tensor::<1>(&format!("{head}.logit_scale"))?),
        })
    }
}

fn put<B: Backend, const D: usize>(
    store:  &mut ParamStore<B>,
    name:   String,
    tensor: Tensor<B, D>,
    mode:   Write,
) -> Result<(), CheckpointError> {
    match mode {
        Write::Register => {
            store.insert(name, tensor);
            Ok(())
        }
        Write::Restore => store.replace(&name, tensor),
    }
}

/// Record the head stored under `head` as recorder bytes.
pub fn encode<B: Backend, H: StoredHead<B>>(head: &str, store: &ParamStore<B>) -> Result<HeadRecord> {
    let module = H::read(head, store)?;
    <HeadRecorder as Recorder<B>>::record(&HeadRecorder::default(), module.into_record(), ())
        .map_err(|e| anyhow!("cannot record {head}: {e:?}"))
}

/// Load recorder bytes into the head stored under `head`.
pub fn decode<B: Backend, H: StoredHead<B>>(
    head:   &str,
    bytes:  &[u8],
    store:  &mut ParamStore<B>,
) -> Result<(), CheckpointError> {
    let template = H::read(head, store).map_err(|e| CheckpointError::Record(format!("{head}: {e}")))?;
    let record = <HeadRecorder as Recorder<B>>::load::<<H as Module<B>>::Record>(
        &HeadRecorder::default(),
        bytes.to_vec(),
        store.device(),
    )
    .map_err(|e| CheckpointError::Record(format!("{head}: {e:?}")))?;
    template.load_record(record).write(head, store, Write::Restore)
}
