//! Assembly stages.
//!
//! Each stage is a function with typed input/output. Stages run strictly in
//! order; each one either completes or fails the whole assembly.
//!
//! ```text
//! base ──→ source ──→ config ──→ env_files ──→ manifest ──→ install ──→ entrypoint
//! ```
//!
//! Stages 2-6 each fill their own layer directory. The entrypoint stage only
//! derives runtime settings; packing and writing happen in `export`.

pub mod base;
pub mod config;
pub mod entrypoint;
pub mod env_files;
pub mod install;
pub mod manifest;
pub mod source;
