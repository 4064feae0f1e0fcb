//! Stage 2: populate the source tree.

use crate::assembly::types::LayerStep;
use crate::build::{BuildContext, TreeSpec, image_path_in};
use crate::rootfs::{copy_tree, mark_opaque};
use boxforge_shared::errors::BoxforgeResult;
use std::path::Path;

pub struct TreeInput<'a> {
    pub context: &'a BuildContext,
    pub tree: &'a TreeSpec,
    /// Normalised in-image destination
    pub dest: &'a str,
    pub layer_dir: &'a Path,
}

pub fn run(input: TreeInput<'_>) -> BoxforgeResult<LayerStep> {
    populate_tree("source", input)
}

/// Copy a context tree into `layer_dir` at `dest`, replacing whatever the
/// lower layers have there.
pub(super) fn populate_tree(name: &'static str, input: TreeInput<'_>) -> BoxforgeResult<LayerStep> {
    let src = input.context.resolve(&input.tree.path)?;
    let dst = image_path_in(input.layer_dir, input.dest);

    let stats = copy_tree(&src, &dst)?;
    mark_opaque(&dst)?;

    tracing::info!(
        step = name,
        from = %input.tree.path.display(),
        to = input.dest,
        files = stats.files,
        dirs = stats.dirs,
        bytes = stats.bytes,
        "Tree copied"
    );

    Ok(LayerStep {
        name,
        dir: input.layer_dir.to_path_buf(),
        created_by: format!(
            "boxforge: COPY {} {}",
            input.tree.path.display(),
            input.dest
        ),
        comment: Some(format!("{} files", stats.files)),
    })
}
