// ============================================================
// Layer 5 — Optimizer Factory
// ============================================================
// Tunable parameters are split into two groups:
//
//   group 0 "weights" — ndim > 1
//   group 1 "biases"  — ndim < 2
//
// Each group carries its own learning rate, the "initial"
// rate warmup scales from, and a weight decay.
//
// The update rule is chosen once, by name, from the config:
//
//   SGD   — momentum, dampening, nesterov
//   Adam  — L2 penalty folded into the gradient
//   AdamW — decoupled decay
//   LARS  — selected by `use_lars`; layer-wise trust ratio,
//           with bias / norm parameters (ndim == 1) excluded
//           from both decay and adaptation
//
// Per-parameter state (momentum buffers, moments) is kept
// by name, so the update runs on the inner backend directly
// against the parameter store.
//
// Reference: Kingma & Ba (2015) Adam
//            Loshchilov & Hutter (2019) AdamW
//            You et al. (2017) LARS

use std::collections::BTreeMap;

use anyhow::Result;
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::Deserialize;

use crate::domain::config::{ConfigError, OptimizerSection};
use crate::ml::params::{GradientSet, ParamStore};

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub name:         &'static str,
    pub params:       Vec<String>,
    pub lr:           f64,
    pub initial_lr:   f64,
    pub weight_decay: f64,
}

/// Split the trainable parameters by rank into the two groups.
pub fn param_groups<B: Backend>(store: &ParamStore<B>) -> Vec<ParamGroup> {
    let mut weights = Vec::new();
    let mut biases  = Vec::new();
    for (name, param) in store.iter().filter(|(_, p)| p.requires_grad) {
        if param.ndim() > 1 {
            weights.push(name.clone());
        } else {
            biases.push(name.clone());
        }
    }
    vec![
        ParamGroup { name: "weights", params: weights, lr: 0.0, initial_lr: 0.0, weight_decay: 0.0 },
        ParamGroup { name: "biases",  params: biases,  lr: 0.0, initial_lr: 0.0, weight_decay: 0.0 },
    ]
}

// ─── Hyperparameters ──────────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SgdParams {
    pub lr:           f64,
    pub momentum:     f64,
    pub dampening:    f64,
    pub weight_decay: f64,
    pub nesterov:     bool,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self { lr: 1e-3, momentum: 0.0, dampening: 0.0, weight_decay: 0.0, nesterov: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamParams {
    #[serde(default = "default_adam_lr")]
    pub lr:           f64,
    #[serde(default = "default_betas")]
    pub betas:        (f64, f64),
    #[serde(default = "default_eps")]
    pub eps:          f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub amsgrad:      bool,
}

fn default_adam_lr() -> f64 { 1e-3 }
fn default_betas() -> (f64, f64) { (0.9, 0.999) }
fn default_eps() -> f64 { 1e-8 }

impl AdamParams {
    fn decoupled_default() -> f64 { 1e-2 }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdamWParams {
    #[serde(default = "default_adam_lr")]
    lr:           f64,
    #[serde(default = "default_betas")]
    betas:        (f64, f64),
    #[serde(default = "default_eps")]
    eps:          f64,
    #[serde(default = "AdamParams::decoupled_default")]
    weight_decay: f64,
    #[serde(default)]
    amsgrad:      bool,
}

impl From<AdamWParams> for AdamParams {
    fn from(p: AdamWParams) -> Self {
        Self { lr: p.lr, betas: p.betas, eps: p.eps, weight_decay: p.weight_decay, amsgrad: p.amsgrad }
    }
}

#[derive(Debug, Clone)]
pub struct LarsParams {
    pub momentum: f64,
    pub eta:      f64,
}

impl Default for LarsParams {
    fn default() -> Self {
        Self { momentum: 0.9, eta: 0.001 }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateRule {
    Sgd(SgdParams),
    Adam(AdamParams),
    AdamW(AdamParams),
    Lars(LarsParams),
}

impl UpdateRule {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateRule::Sgd(_)   => "SGD",
            UpdateRule::Adam(_)  => "Adam",
            UpdateRule::AdamW(_) => "AdamW",
            UpdateRule::Lars(_)  => "LARS",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot<B: Backend> {
    step:  usize,
    first: Option<Tensor<B, 1>>,
    second: Option<Tensor<B, 1>>,
    max_second: Option<Tensor<B, 1>>,
}

// ─── Optimizer ────────────────────────────────────────────────────────────────
#[derive(Debug)]
pub struct Optimizer<B: Backend> {
    rule:   UpdateRule,
    groups: Vec<ParamGroup>,
    state:  BTreeMap<String, Slot<B>>,
}

/// Build the optimizer from the `optimizer` section. Unknown names
/// fail here, before the first step.
pub fn build_optimizer<B: Backend>(
    store:   &ParamStore<B>,
    section: &OptimizerSection,
) -> Result<Optimizer<B>, ConfigError> {
    let mut groups = param_groups(store);

    let (rule, lr, weight_decay) = if section.use_lars {
        (UpdateRule::Lars(LarsParams::default()), 0.0, section.weight_decay)
    } else {
        let spec = &section.optimizer;
        match spec.name.as_str() {
            "SGD" => {
                let p: SgdParams = spec.params()?;
                let (lr, wd) = (p.lr, p.weight_decay);
                (UpdateRule::Sgd(p), lr, wd)
            }
            "Adam" => {
                let p: AdamParams = spec.params()?;
                let (lr, wd) = (p.lr, p.weight_decay);
                (UpdateRule::Adam(p), lr, wd)
            }
            "AdamW" => {
                let p: AdamParams = spec.params::<AdamWParams>()?.into();
                let (lr, wd) = (p.lr, p.weight_decay);
                (UpdateRule::AdamW(p), lr, wd)
            }
            other => return Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    };
    if lr < 0.0 {
        return Err(ConfigError::invalid("optimizer.params.lr", "must not be negative"));
    }
    for group in groups.iter_mut() {
        group.lr           = lr;
        group.initial_lr   = lr;
        group.weight_decay = weight_decay;
    }
    Ok(Optimizer { rule, groups, state: BTreeMap::new() })
}

impl<B: Backend> Optimizer<B> {
    pub fn rule(&self) -> &UpdateRule {
        &self.rule
    }

    pub fn is_lars(&self) -> bool {
        matches!(self.rule, UpdateRule::Lars(_))
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    /// Apply one update. Parameters without a gradient are skipped.
    pub fn step(&mut self, params: &mut ParamStore<B>, grads: &GradientSet<B>) -> Result<()> {
        let Self { rule, groups, state } = self;
        for group in groups.iter() {
            for name in &group.params {
                let Some(grad) = grads.get(name) else { continue };
                let Some(param) = params.get(name) else { continue };
                let exclude = param.ndim() == 1;
                let value   = param.value.clone();
                let slot    = state.entry(name.clone()).or_default();
                slot.step  += 1;

                let updated = match rule {
                    UpdateRule::Sgd(p)   => sgd(p, group, slot, value, grad.clone()),
                    UpdateRule::Adam(p)  => adam(p, group, slot, value, grad.clone(), false),
                    UpdateRule::AdamW(p) => adam(p, group, slot, value, grad.clone(), true),
                    UpdateRule::Lars(p)  => lars(p, group, slot, value, grad.clone(), exclude),
                };
                params.set_value(name, updated)?;
            }
        }
        Ok(())
    }
}

fn sgd<B: Backend>(
    p:     &SgdParams,
    group: &ParamGroup,
    slot:  &mut Slot<B>,
    value: Tensor<B, 1>,
    grad:  Tensor<B, 1>,
) -> Tensor<B, 1> {
    let mut d_p = grad;
    if group.weight_decay != 0.0 {
        d_p = d_p + value.clone().mul_scalar(group.weight_decay);
    }
    if p.momentum != 0.0 {
        let buf = match slot.first.take() {
            None      => d_p.clone(),
            Some(buf) => buf.mul_scalar(p.momentum) + d_p.clone().mul_scalar(1.0 - p.dampening),
        };
        d_p = if p.nesterov { d_p + buf.clone().mul_scalar(p.momentum) } else { buf.clone() };
        slot.first = Some(buf);
    }
    value - d_p.mul_scalar(group.lr)
}

fn adam<B: Backend>(
    p:         &AdamParams,
    group:     &ParamGroup,
    slot:      &mut Slot<B>,
    value:     Tensor<B, 1>,
    grad:      Tensor<B, 1>,
    decoupled: bool,
) -> Tensor<B, 1> {
    let (beta1, beta2) = p.betas;
    let mut value = value;
    let mut grad  = grad;
    if group.weight_decay != 0.0 {
        if decoupled {
            value = value.mul_scalar(1.0 - group.lr * group.weight_decay);
        } else {
            grad = grad + value.clone().mul_scalar(group.weight_decay);
        }
    }

    let m = match slot.first.take() {
        None    => grad.clone().mul_scalar(1.0 - beta1),
        Some(m) => m.mul_scalar(beta1) + grad.clone().mul_scalar(1.0 - beta1),
    };
    let v = match slot.second.take() {
        None    => grad.powf_scalar(2.0).mul_scalar(1.0 - beta2),
        Some(v) => v.mul_scalar(beta2) + grad.powf_scalar(2.0).mul_scalar(1.0 - beta2),
    };

    let t   = slot.step as i32;
    let bc1 = 1.0 - beta1.powi(t);
    let bc2 = 1.0 - beta2.powi(t);

    let second = if p.amsgrad {
        let max_v = match slot.max_second.take() {
            None        => v.clone(),
            Some(max_v) => max_v.max_pair(v.clone()),
        };
        slot.max_second = Some(max_v.clone());
        max_v
    } else {
        v.clone()
    };
    let denom = second.sqrt().div_scalar(bc2.sqrt()).add_scalar(p.eps);
    let update = m.clone().div(denom).mul_scalar(group.lr / bc1);

    slot.first  = Some(m);
    slot.second = Some(v);
    value - update
}

fn lars<B: Backend>(
    p:       &LarsParams,
    group:   &ParamGroup,
    slot:    &mut Slot<B>,
    value:   Tensor<B, 1>,
    grad:    Tensor<B, 1>,
    exclude: bool,
) -> Tensor<B, 1> {
    let mut d_p = grad;
    if !exclude {
        d_p = d_p + value.clone().mul_scalar(group.weight_decay);

        let param_norm  = l2(&value);
        let update_norm = l2(&d_p);
        let q = if param_norm > 0.0 && update_norm > 0.0 {
            p.eta * param_norm / update_norm
        } else {
            1.0
        };
        d_p = d_p.mul_scalar(q);
    }
    let mu = match slot.first.take() {
        None     => d_p,
        Some(mu) => mu.mul_scalar(p.momentum) + d_p,
    };
    slot.first = Some(mu.clone());
    value - mu.mul_scalar(group.lr)
}

fn l2<B: Backend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().powf_scalar(2.0).sum().into_scalar().elem::<f64>().sqrt()
}
