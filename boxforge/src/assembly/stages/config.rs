//! Stage 3: populate the configuration tree.
//!
//! Same copy semantics as the source tree, in a layer of its own. A build
//! with `config: null` skips the copy but still completes the stage.

use super::source::{TreeInput, populate_tree};
use crate::assembly::types::LayerStep;
use boxforge_shared::errors::BoxforgeResult;

/// `None` input means the configuration tree is disabled.
pub fn run(input: Option<TreeInput<'_>>) -> BoxforgeResult<Option<LayerStep>> {
    match input {
        Some(input) => populate_tree("config", input).map(Some),
        None => {
            tracing::info!(step = "config", "No configuration tree declared, skipping");
            Ok(None)
        }
    }
}
