// ============================================================
// Layer 5 — Learning-Rate Schedules
// ============================================================
// Three policies move the per-group learning rates:
//
//   Scheduler — selected by name from the config and stepped
//               per batch (`batch_sch`) or per epoch:
//                 StepLR, MultiStepLR, ExponentialLR,
//                 CosineAnnealingLR, CosineAnnealingWarmRestarts,
//                 ReduceLROnPlateau
//
//   Warmup    — ramps each group linearly from 0 to its
//               initial rate over `warmup_steps` optimizer steps
//
//   lars_adjust — the LARS recipe: linear warmup over ten
//               epochs, then cosine decay to 0.1% of the base
//
// A restart-based schedule signals its period boundary with
// `ScheduleEvent::Restart`, and warmup signals its last step
// with `WarmupEvent::Completed`. The loop evaluates on either.

use std::f64::consts::PI;

use serde::Deserialize;

use crate::domain::config::{ConfigError, NamedSpec, OptimizerSection};
use crate::ml::optim::ParamGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    Continue,
    /// The rates just returned to their base values.
    Restart,
}

// ─── Hyperparameters ──────────────────────────────────────────────────────────
fn default_gamma() -> f64 { 0.1 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepParams {
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma:     f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiStepParams {
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma:      f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExponentialParams {
    pub gamma: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosineParams {
    #[serde(rename = "T_max")]
    pub t_max:   usize,
    #[serde(default)]
    pub eta_min: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmRestartParams {
    #[serde(rename = "T_0")]
    pub t_0:     usize,
    #[serde(rename = "T_mult", default = "one")]
    pub t_mult:  usize,
    #[serde(default)]
    pub eta_min: f64,
}

fn one() -> usize { 1 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlateauParams {
    pub mode:           String,
    pub factor:         f64,
    pub patience:       usize,
    pub threshold:      f64,
    pub threshold_mode: String,
    pub cooldown:       usize,
    pub min_lr:         f64,
    pub eps:            f64,
}

impl Default for PlateauParams {
    fn default() -> Self {
        Self {
            mode:           "min".into(),
            factor:         0.1,
            patience:       10,
            threshold:      1e-4,
            threshold_mode: "rel".into(),
            cooldown:       0,
            min_lr:         0.0,
            eps:            1e-8,
        }
    }
}

#[derive(Debug, Clone)]
enum Policy {
    Step(StepParams),
    MultiStep(MultiStepParams),
    Exponential(ExponentialParams),
    Cosine(CosineParams),
    WarmRestarts { params: WarmRestartParams, t_i: usize, t_cur: usize },
    Plateau { params: PlateauParams, best: Option<f64>, bad_epochs: usize, cooldown: usize },
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    policy:     Policy,
    base_lrs:   Vec<f64>,
    last_epoch: usize,
}

/// Build a scheduler over the groups' initial rates.
pub fn build_scheduler(spec: &NamedSpec, groups: &[ParamGroup]) -> Result<Scheduler, ConfigError> {
    let policy = match spec.name.as_str() {
        "StepLR" => {
            let p: StepParams = spec.params()?;
            if p.step_size == 0 {
                return Err(ConfigError::invalid("scheduler.params.step_size", "must be positive"));
            }
            Policy::Step(p)
        }
        "MultiStepLR"       => Policy::MultiStep(spec.params()?),
        "ExponentialLR"     => Policy::Exponential(spec.params()?),
        "CosineAnnealingLR" => {
            let p: CosineParams = spec.params()?;
            if p.t_max == 0 {
                return Err(ConfigError::invalid("scheduler.params.T_max", "must be positive"));
            }
            Policy::Cosine(p)
        }
        "CosineAnnealingWarmRestarts" => {
            let p: WarmRestartParams = spec.params()?;
            if p.t_0 == 0 || p.t_mult == 0 {
                return Err(ConfigError::invalid("scheduler.params.T_0", "T_0 and T_mult must be positive"));
            }
            Policy::WarmRestarts { t_i: p.t_0, t_cur: 0, params: p }
        }
        "ReduceLROnPlateau" => {
            let p: PlateauParams = spec.params()?;
            if p.mode != "min" && p.mode != "max" {
                return Err(ConfigError::invalid("scheduler.params.mode", "expected `min` or `max`"));
            }
            if p.threshold_mode != "rel" && p.threshold_mode != "abs" {
                return Err(ConfigError::invalid("scheduler.params.threshold_mode", "expected `rel` or `abs`"));
            }
            if p.factor >= 1.0 {
                return Err(ConfigError::invalid("scheduler.params.factor", "must be below 1"));
            }
            Policy::Plateau { params: p, best: None, bad_epochs: 0, cooldown: 0 }
        }
        other => return Err(ConfigError::UnknownScheduler(other.to_string())),
    };
    Ok(Scheduler {
        policy,
        base_lrs:   groups.iter().map(|g| g.initial_lr).collect(),
        last_epoch: 0,
    })
}

impl Scheduler {
    pub fn base_lrs(&self) -> &[f64] {
        &self.base_lrs
    }

    /// Advance one period and write the new rates into `groups`.
    /// `metric` feeds ReduceLROnPlateau and is ignored otherwise.
    pub fn step(&mut self, groups: &mut [ParamGroup], metric: Option<f64>) -> ScheduleEvent {
        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let base  = &self.base_lrs;

        let closed_form = |f: &dyn Fn(f64) -> f64, groups: &mut [ParamGroup]| {
            for (group, &b) in groups.iter_mut().zip(base.iter()) {
                group.lr = f(b);
            }
        };

        match &mut self.policy {
            Policy::Step(p) => {
                let k = (epoch / p.step_size) as i32;
                closed_form(&|b| b * p.gamma.powi(k), groups);
            }
            Policy::MultiStep(p) => {
                let k = p.milestones.iter().filter(|&&m| m <= epoch).count() as i32;
                closed_form(&|b| b * p.gamma.powi(k), groups);
            }
            Policy::Exponential(p) => {
                closed_form(&|b| b * p.gamma.powi(epoch as i32), groups);
            }
            Policy::Cosine(p) => {
                let t = epoch as f64 / p.t_max as f64;
                closed_form(&|b| p.eta_min + (b - p.eta_min) * (1.0 + (PI * t).cos()) / 2.0, groups);
            }
            Policy::WarmRestarts { params, t_i, t_cur } => {
                *t_cur += 1;
                if *t_cur >= *t_i {
                    *t_cur -= *t_i;
                    *t_i   *= params.t_mult;
                }
                let t = *t_cur as f64 / *t_i as f64;
                let eta_min = params.eta_min;
                closed_form(&|b| eta_min + (b - eta_min) * (1.0 + (PI * t).cos()) / 2.0, groups);
                if *t_cur == 0 {
                    return ScheduleEvent::Restart;
                }
            }
            Policy::Plateau { params, best, bad_epochs, cooldown } => {
                let Some(current) = metric else {
                    return ScheduleEvent::Continue;
                };
                if is_better(params, current, *best) {
                    *best       = Some(current);
                    *bad_epochs = 0;
                } else {
                    *bad_epochs += 1;
                }
                if *cooldown > 0 {
                    *cooldown  -= 1;
                    *bad_epochs = 0;
                }
                if *bad_epochs > params.patience {
                    for group in groups.iter_mut() {
                        let new_lr = (group.lr * params.factor).max(params.min_lr);
                        if group.lr - new_lr > params.eps {
                            group.lr = new_lr;
                        }
                    }
                    *cooldown   = params.cooldown;
                    *bad_epochs = 0;
                }
            }
        }
        ScheduleEvent::Continue
    }
}

fn is_better(p: &PlateauParams, current: f64, best: Option<f64>) -> bool {
    let Some(best) = best else { return true };
    match (p.mode.as_str(), p.threshold_mode.as_str()) {
        ("min", "rel") => current < best * (1.0 - p.threshold),
        ("min", _)     => current < best - p.threshold,
        (_, "rel")     => current > best * (1.0 + p.threshold),
        _              => current > best + p.threshold,
    }
}

// ─── Warmup ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub enum WarmupEvent {
    /// Warmup is over, or this step is between adjustments.
    Idle,
    Adjusted(Vec<f64>),
    /// Rates reached their initial values on this step.
    Completed(Vec<f64>),
}

#[derive(Debug, Clone)]
pub struct Warmup {
    steps: usize,
    every: usize,
}

impl Warmup {
    pub fn new(steps: usize) -> Self {
        Self { steps, every: (steps / 20).max(1) }
    }

    /// True while `total_step` is still inside the ramp.
    pub fn is_active(&self, total_step: usize) -> bool {
        total_step <= self.steps
    }

    pub fn ratio(&self, total_step: usize) -> f64 {
        if self.steps == 0 {
            return 1.0;
        }
        (total_step.min(self.steps)) as f64 / self.steps as f64
    }

    /// Set every group to `ratio * initial_lr` on adjustment steps.
    pub fn apply(&self, total_step: usize, groups: &mut [ParamGroup]) -> WarmupEvent {
        if !self.is_active(total_step) {
            return WarmupEvent::Idle;
        }
        if total_step % self.every != 0 && total_step != self.steps {
            return WarmupEvent::Idle;
        }
        let ratio = self.ratio(total_step);
        for group in groups.iter_mut() {
            group.lr = ratio * group.initial_lr;
        }
        let lrs = groups.iter().map(|g| g.lr).collect();
        if total_step == self.steps {
            WarmupEvent::Completed(lrs)
        } else {
            WarmupEvent::Adjusted(lrs)
        }
    }
}

// ─── LARS adjustment ──────────────────────────────────────────────────────────
/// Rate for `step` under the LARS recipe, written to both groups.
pub fn lars_adjust(
    section:    &OptimizerSection,
    batch_size: usize,
    nbatch:     usize,
    step:       usize,
    groups:     &mut [ParamGroup],
) -> f64 {
    let max_steps    = section.epochs * nbatch;
    let warmup_steps = 10 * nbatch;
    let base_lr      = batch_size as f64 / 256.0;

    let lr = if step < warmup_steps {
        base_lr * step as f64 / warmup_steps as f64
    } else {
        let step      = (step - warmup_steps) as f64;
        let max_steps = max_steps.saturating_sub(warmup_steps).max(1) as f64;
        let q         = 0.5 * (1.0 + (PI * step / max_steps).cos());
        let end_lr    = base_lr * 0.001;
        base_lr * q + end_lr * (1.0 - q)
    };

    if let Some(g) = groups.get_mut(0) {
        g.lr = lr * section.learning_rate_weights;
    }
    if let Some(g) = groups.get_mut(1) {
        g.lr = lr * section.learning_rate_biases;
    }
    lr
}
