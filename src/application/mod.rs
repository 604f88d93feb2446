// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Turns a resolved configuration into a finished run. This
// layer only coordinates: data, model and loop are built by
// the layers below, and nothing here prints.
//
// Reference: Clean Architecture pattern

/// Train, evaluate, or gather audio statistics
pub mod run_use_case;
