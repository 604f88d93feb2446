// ============================================================
// Layer 3 — Run State
// ============================================================
// Counters written only by the training loop. Logging reads
// them; nothing else does. They are reset when training
// starts and only ever move forward.

use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RunState {
    /// Index of the epoch in progress
    pub epoch:      usize,
    /// Optimizer steps since training started
    pub total_step: usize,
    /// Samples seen across all ranks
    pub total_inst: usize,
    /// Sum of the unscaled step losses
    pub total_loss: f64,
    pub start_time: Instant,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            epoch:      0,
            total_step: 0,
            total_inst: 0,
            total_loss: 0.0,
            start_time: Instant::now(),
        }
    }

    /// Record one finished optimizer step.
    pub fn advance(&mut self, loss: f64, instances: usize) {
        self.total_step += 1;
        self.total_loss += loss;
        self.total_inst += instances;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.total_step == 0 {
            return 0.0;
        }
        self.total_loss / self.total_step as f64
    }

    /// Instances per second since training started.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_inst as f64 / elapsed
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall time spent in each phase of a step, averaged per epoch.
#[derive(Debug)]
pub struct PhaseTimer {
    last:   Instant,
    phases: BTreeMap<&'static str, Vec<f64>>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self { last: Instant::now(), phases: BTreeMap::new() }
    }

    /// Close the current phase under `key` and start the next one.
    pub fn mark(&mut self, key: &'static str) {
        let now = Instant::now();
        self.phases
            .entry(key)
            .or_default()
            .push(now.duration_since(self.last).as_secs_f64());
        self.last = now;
    }

    pub fn summary(&self) -> String {
        self.phases
            .iter()
            .map(|(k, v)| {
                let mean = if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
                format!("{k} {mean:.2}")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}
