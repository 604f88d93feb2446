// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting pieces used by the loop and the model:
//
//   checkpoint.rs — versioned bincode snapshots of the config
//                   and per-head weights, one file per step
//
//   metrics.rs    — running averages and the multi-label
//                   ranking metrics printed after evaluation
//
//   gold.rs       — the gold-label CSV read by the report path
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)

/// Checkpoint records and the per-run manager
pub mod checkpoint;

/// Average meter and multi-label metric aggregator
pub mod metrics;

/// Gold-label file reader
pub mod gold;
