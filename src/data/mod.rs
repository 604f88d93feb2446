// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between a split on disk and a device-resident
// batch:
//
//   <data_root>/<split>.jsonl
//       │
//       ▼
//   PairDataset      → implements Burn's Dataset trait
//       │
//       ▼
//   ShardedLoader    → shuffles per epoch, shards per rank,
//       │              yields Vec<PairSample> per batch
//       ▼
//   BatchPipeline    → Burn Batcher: collate, tensors, audio
//                      channel axis, bilinear image resize
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Image/audio pairs read from JSON lines
pub mod dataset;

/// The data-source contract over a dataset, plus split rules
pub mod loader;

/// Samples to tensor batch
pub mod batcher;
