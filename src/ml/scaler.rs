// ============================================================
// Layer 5 — Gradient Scaler
// ============================================================
// Dynamic loss scaling for reduced-precision backends:
//
//   1. scale_loss  — multiply the loss before backward
//   2. step        — unscale the gradients; if any is inf/NaN
//                    skip the optimizer step, otherwise clip
//                    (optional) and step
//   3. update      — on overflow shrink the scale by
//                    `backoff_factor`; after `growth_interval`
//                    clean steps grow it by `growth_factor`
//
// The scale is local to each rank and owned by the loop.
// When disabled every call is a pass-through.

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

use crate::ml::optim::Optimizer;
use crate::ml::params::{GradientSet, ParamStore};

#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled:         bool,
    scale:           f64,
    growth_factor:   f64,
    backoff_factor:  f64,
    growth_interval: usize,
    growth_tracker:  usize,
    found_inf:       bool,
}

/// What `GradScaler::step` did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// The optimizer ran; carries the gradient norm when clipping was on.
    Applied { grad_norm: Option<f64> },
    /// Non-finite gradients; the parameters were left untouched.
    Skipped,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale:           65536.0,
            growth_factor:   2.0,
            backoff_factor:  0.5,
            growth_interval: 2000,
            growth_tracker:  0,
            found_inf:       false,
        }
    }

    pub fn scale(&self) -> f64 {
        if self.enabled { self.scale } else { 1.0 }
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled { loss.mul_scalar(self.scale) } else { loss }
    }

    pub fn step<B: Backend>(
        &mut self,
        optimizer: &mut Optimizer<B>,
        params:    &mut ParamStore<B>,
        grads:     &mut GradientSet<B>,
        max_norm:  f64,
    ) -> Result<StepOutcome> {
        if self.enabled {
            grads.scale(1.0 / self.scale);
            self.found_inf = !grads.all_finite();
            if self.found_inf {
                tracing::debug!("Non-finite gradients at scale {}; skipping step", self.scale);
                return Ok(StepOutcome::Skipped);
            }
        }
        let grad_norm = (max_norm > 0.0).then(|| grads.clip_global_norm(max_norm));
        optimizer.step(params, grads)?;
        Ok(StepOutcome::Applied { grad_norm })
    }

    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if self.found_inf {
            self.scale         *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale         *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
    }
}
