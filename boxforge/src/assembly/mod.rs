//! Image assembly orchestration.
//!
//! ## Architecture
//!
//! An `Assembly` runs seven stages strictly in order:
//!
//! ```text
//! 1. Base ──→ 2. Source ──→ 3. Config ──→ 4. EnvFiles ──→ 5. Manifest
//!                                                              │
//!                          7. Entrypoint + export ←── 6. Install
//! ```
//!
//! Stages 2-6 each write one layer directory in the build workspace. The
//! last stage derives the image config and `export` writes the OCI layout.
//! `CleanupGuard` removes the workspace and any staged output on failure.

mod export;
mod pipeline;
mod stages;
mod types;

pub use export::check_output;
pub use pipeline::{Assembly, AssemblyReport, AssemblyRequest};
pub use stages::entrypoint::epoch_rfc3339;
pub use types::{AssemblyState, StepTiming};
