// ============================================================
// Layer 5 — ML / Training Layer (Burn)
// ============================================================
// Everything that touches autodiff lives here.
//
//   params.rs       — named parameter store, tunable selection,
//                     autodiff leaves and gradient sets
//   optim.rs        — optimizers by name (SGD, Adam, AdamW) or LARS,
//                     always over two groups: weights and biases
//   scheduler.rs    — learning-rate schedules by name, warmup,
//                     and the LARS cosine adjustment
//   scaler.rs       — dynamic loss scaling for mixed precision
//   executor.rs     — local and distributed execution, gradient
//                     averaging across ranks
//   model.rs        — what the loop needs from a model
//   heads.rs        — sub-heads as Burn modules, recorded per head
//   dual_encoder.rs — the image/audio contrastive model
//   monitor.rs      — the training and evaluation loop
//
// Reference: Burn Book §5 (Training)

/// Named parameters and gradients
pub mod params;

/// Optimizer factory and update rules
pub mod optim;

/// Learning-rate schedules and warmup
pub mod scheduler;

pub mod scaler;

/// Local and data-parallel execution
pub mod executor;

/// The model contract used by the loop
pub mod model;

/// Burn modules and records for the model's sub-heads
pub mod heads;

pub mod dual_encoder;

/// Training and evaluation loop
pub mod monitor;
