//! BoxForge Core - Shared code for the builder library and CLI
//!
//! This crate contains the error type, OCI layout conventions and the
//! constants that every BoxForge crate agrees on.

pub mod constants;
pub mod errors;
pub mod layout;

pub use errors::{BoxforgeError, BoxforgeResult};
pub use layout::OciLayoutPaths;
