//! Filesystem population helpers
//!
//! This module copies build inputs into layer directories.

mod copy;
mod pattern;

pub use copy::{CopyStats, copy_file, copy_tree, mark_opaque};
pub use pattern::FilePattern;
