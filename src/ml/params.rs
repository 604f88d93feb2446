// ============================================================
// Layer 5 — Parameter Store and Selector
// ============================================================
// Model weights live in a flat, named store rather than in
// module fields:
//
//   "audio_head.weight" → Parameter { value, shape, requires_grad }
//
// Each training step lifts the store into autodiff leaves,
// runs the forward pass against them and reads the gradients
// back by name. Fresh leaves every step means there is never
// a stale gradient to zero.
//
// The selector (`select_tunable`) is the single place where
// requires_grad is decided: exactly the declared tunable
// names keep it, every other parameter is frozen.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Shape, Tensor,
};

use crate::infra::checkpoint::CheckpointError;

/// Names the model declares as tunable.
pub type TunableSet = BTreeSet<String>;

#[derive(Debug, Clone)]
pub struct Parameter<B: Backend> {
    /// Flattened; `shape` restores the logical layout
    pub value:         Tensor<B, 1>,
    pub shape:         Vec<usize>,
    pub requires_grad: bool,
}

impl<B: Backend> Parameter<B> {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone)]
pub struct ParamStore<B: Backend> {
    params: BTreeMap<String, Parameter<B>>,
    device: B::Device,
}

impl<B: Backend> ParamStore<B> {
    pub fn new(device: B::Device) -> Self {
        Self { params: BTreeMap::new(), device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Register a parameter. New parameters track gradients until
    /// the selector says otherwise.
    pub fn insert<const D: usize>(&mut self, name: impl Into<String>, tensor: Tensor<B, D>) {
        let shape = tensor.dims().to_vec();
        let numel: usize = shape.iter().product();
        let value = tensor.reshape([numel]);
        self.params.insert(name.into(), Parameter { value, shape, requires_grad: true });
    }

    /// Overwrite the value of an existing parameter; the logical shape
    /// must match and `requires_grad` is kept.
    pub fn replace<const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Result<(), CheckpointError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| CheckpointError::UnknownParameter(name.to_string()))?;
        let shape = tensor.dims().to_vec();
        if param.shape != shape {
            return Err(CheckpointError::ShapeMismatch {
                name:     name.to_string(),
                expected: param.shape.clone(),
                found:    shape,
            });
        }
        param.value = tensor.reshape([param.numel()]);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter<B>> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter<B>)> {
        self.params.iter()
    }

    /// The parameter in its logical shape.
    pub fn tensor<const D: usize>(&self, name: &str) -> Result<Tensor<B, D>> {
        let param = self.params.get(name).with_context(|| format!("no parameter named {name}"))?;
        Ok(param.value.clone().reshape(logical_shape::<D>(name, &param.shape)?))
    }

    pub fn to_vec(&self, name: &str) -> Result<Vec<f32>> {
        let param = self.params.get(name).with_context(|| format!("no parameter named {name}"))?;
        param
            .value
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("cannot read parameter {name}: {e:?}"))
    }

    pub fn set_value(&mut self, name: &str, value: Tensor<B, 1>) -> Result<()> {
        let param = self.params.get_mut(name).with_context(|| format!("no parameter named {name}"))?;
        if value.dims()[0] != param.numel() {
            bail!("parameter {name}: update has {} values, expected {}", value.dims()[0], param.numel());
        }
        param.value = value;
        Ok(())
    }

    /// Freeze every parameter outside `tunable`. Unknown names are an
    /// error so the trainable set can never silently differ.
    pub fn select_tunable(&mut self, tunable: &TunableSet) -> Result<()> {
        if let Some(missing) = tunable.iter().find(|n| !self.params.contains_key(*n)) {
            bail!("tunable parameter {missing} does not exist in the model");
        }
        for (name, param) in self.params.iter_mut() {
            param.requires_grad = tunable.contains(name);
        }
        Ok(())
    }

    pub fn trainable_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|(_, p)| p.requires_grad)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn numel(&self, trainable_only: bool) -> usize {
        self.params
            .values()
            .filter(|p| !trainable_only || p.requires_grad)
            .map(Parameter::numel)
            .sum()
    }

    /// Lift the store into autodiff leaves. With `track` off nothing
    /// records gradients, which is the no-grad evaluation mode.
    pub fn leaves<AB>(&self, track: bool) -> Leaves<AB>
    where
        AB: AutodiffBackend<InnerBackend = B>,
    {
        let tensors = self
            .params
            .iter()
            .map(|(name, p)| {
                let leaf = Tensor::<AB, 1>::from_inner(p.value.clone());
                let leaf = if track && p.requires_grad { leaf.require_grad() } else { leaf };
                (name.clone(), (leaf, p.shape.clone(), track && p.requires_grad))
            })
            .collect();
        Leaves { tensors }
    }
}

fn logical_shape<const D: usize>(name: &str, shape: &[usize]) -> Result<Shape> {
    let dims: [usize; D] = shape
        .try_into()
        .map_err(|_| anyhow::anyhow!("parameter {name} has shape {shape:?}, asked for rank {D}"))?;
    Ok(Shape::new(dims))
}

// ─── Autodiff leaves ──────────────────────────────────────────────────────────
/// One step's view of the parameters on the autodiff backend.
pub struct Leaves<AB: AutodiffBackend> {
    tensors: BTreeMap<String, (Tensor<AB, 1>, Vec<usize>, bool)>,
}

impl<AB: AutodiffBackend> Leaves<AB> {
    pub fn get<const D: usize>(&self, name: &str) -> Result<Tensor<AB, D>> {
        let (leaf, shape, _) = self
            .tensors
            .get(name)
            .with_context(|| format!("no parameter named {name}"))?;
        Ok(leaf.clone().reshape(logical_shape::<D>(name, shape)?))
    }

    /// Gradients of every tracked leaf that took part in the graph.
    /// Parameters the loss never touched are simply absent.
    pub fn gradients(&self, grads: &AB::Gradients) -> GradientSet<AB::InnerBackend> {
        let grads = self
            .tensors
            .iter()
            .filter(|(_, (_, _, tracked))| *tracked)
            .filter_map(|(name, (leaf, _, _))| leaf.grad(grads).map(|g| (name.clone(), g)))
            .collect();
        GradientSet { grads }
    }
}

// ─── Gradients ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct GradientSet<B: Backend> {
    pub grads: BTreeMap<String, Tensor<B, 1>>,
}

impl<B: Backend> GradientSet<B> {
    pub fn new() -> Self {
        Self { grads: BTreeMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<B, 1>> {
        self.grads.get(name)
    }

    pub fn scale(&mut self, factor: f64) {
        for g in self.grads.values_mut() {
            *g = g.clone().mul_scalar(factor);
        }
    }

    /// L2 norm over all gradients taken together.
    pub fn global_norm(&self) -> f64 {
        self.grads
            .values()
            .map(|g| g.clone().powf_scalar(2.0).sum().into_scalar().elem::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    pub fn all_finite(&self) -> bool {
        self.grads
            .values()
            .all(|g| g.clone().abs().sum().into_scalar().elem::<f64>().is_finite())
    }

    /// Rescale so the global norm is at most `max_norm`; returns the
    /// norm before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            self.scale(coef);
        }
        norm
    }
}

impl<B: Backend> Default for GradientSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type Inner = NdArray<f32>;
    type TestBackend = Autodiff<Inner>;

    fn filled<const D: usize>(shape: [usize; D], value: f32) -> Tensor<Inner, D> {
        Tensor::full(shape, value, &Default::default())
    }

    fn store() -> ParamStore<Inner> {
        let mut store = ParamStore::new(Default::default());
        store.insert("image_head.weight", filled([2, 3], 0.1));
        store.insert("image_head.bias", filled([3], 0.0));
        store.insert("audio_head.weight", filled([2, 3], 0.2));
        store.insert("audio_head.bias", filled([3], 0.0));
        store.insert("loss_head.logit_scale", filled([1], 1.0));
        store
    }

    #[test]
    fn test_selector_freezes_everything_else() {
        let mut store = store();
        let tunable: TunableSet = ["audio_head.weight", "audio_head.bias", "loss_head.logit_scale"]
            .into_iter()
            .map(String::from)
            .collect();
        store.select_tunable(&tunable).unwrap();

        let trainable: TunableSet = store.trainable_names().into_iter().collect();
        assert_eq!(trainable, tunable);
        assert_eq!(store.numel(false), 19);
        assert_eq!(store.numel(true), 10);
    }

    #[test]
    fn test_selector_rejects_unknown_names() {
        let mut store = store();
        let tunable: TunableSet = ["text_head.weight".to_string()].into_iter().collect();
        assert!(store.select_tunable(&tunable).is_err());
        // nothing was frozen by the failed call
        assert_eq!(store.trainable_names().len(), 5);
    }

    #[test]
    fn test_frozen_leaves_have_no_gradient() {
        let mut store = store();
        let tunable: TunableSet = ["audio_head.weight".to_string()].into_iter().collect();
        store.select_tunable(&tunable).unwrap();

        let leaves = store.leaves::<TestBackend>(true);
        let a = leaves.get::<2>("audio_head.weight").unwrap();
        let i = leaves.get::<2>("image_head.weight").unwrap();
        let loss = (a * i).sum();
        let grads = leaves.gradients(&loss.backward());

        assert_eq!(grads.grads.len(), 1);
        let g = grads.get("audio_head.weight").unwrap().clone().into_data().to_vec::<f32>().unwrap();
        assert!(g.iter().all(|v| (v - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_untracked_leaves_produce_no_gradients() {
        let store  = store();
        let leaves = store.leaves::<TestBackend>(false);
        let loss   = leaves.get::<2>("audio_head.weight").unwrap().sum();
        assert!(leaves.gradients(&loss.backward()).grads.is_empty());
    }

    #[test]
    fn test_replace_keeps_shape_and_selection() {
        let mut store = store();
        let tunable: TunableSet = ["audio_head.weight".to_string()].into_iter().collect();
        store.select_tunable(&tunable).unwrap();

        store.replace("audio_head.weight", filled([2, 3], 9.0)).unwrap();
        assert_eq!(store.to_vec("audio_head.weight").unwrap(), vec![9.0; 6]);
        assert_eq!(store.trainable_names(), vec!["audio_head.weight".to_string()]);
        assert_eq!(store.tensor::<2>("audio_head.weight").unwrap().dims(), [2, 3]);

        assert!(matches!(
            store.replace("audio_head.weight", filled([3, 2], 0.0)),
            Err(CheckpointError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            store.replace("text_head.weight", filled([2, 3], 0.0)),
            Err(CheckpointError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_clip_global_norm() {
        let device = Default::default();
        let mut grads = GradientSet::<Inner>::new();
        grads.grads.insert("a".into(), Tensor::from_data(TensorData::new(vec![3.0f32, 4.0], [2]), &device));
        assert!((grads.global_norm() - 5.0).abs() < 1e-6);
        let before = grads.clip_global_norm(1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((grads.global_norm() - 1.0).abs() < 1e-4);
        assert!(grads.all_finite());
    }
}
