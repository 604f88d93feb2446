// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types shared by every other layer:
//
//   config.rs    — the hierarchical run configuration
//                  (running / optimizer / model sections)
//   sample.rs    — raw arrays and raw batches as produced by
//                  a data source, before any tensor exists
//   run_state.rs — counters owned by the training loop
//   traits.rs    — the data-source contract and the echo sink
//
// No Burn types are allowed here. Tensors only appear once
// a raw batch crosses into the batch pipeline (Layer 4).

pub mod config;

pub mod sample;

pub mod run_state;

pub mod traits;
