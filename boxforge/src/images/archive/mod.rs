//! Layer archive handling.
//!
//! `pack` turns layer directories into deterministic blobs, `unpack` applies
//! blobs onto a rootfs, `digest` hashes content on the way through.

mod digest;
mod pack;
mod unpack;

pub use digest::{HashingWriter, sha256_bytes, sha256_file};
pub use pack::{PackedLayer, is_empty_layer, pack_layer, pack_layers};
pub use unpack::{UnpackStats, apply_layer, apply_layer_blob, unpack_layers};

use boxforge_shared::errors::BoxforgeResult;
use std::path::Path;

/// Flatten the OCI image layout at `image_dir` into `dest`.
///
/// `ref_name` selects a tagged image when the index lists several.
pub fn unpack_image(image_dir: &Path, ref_name: Option<&str>, dest: &Path) -> BoxforgeResult<UnpackStats> {
    let layout = crate::images::OciImageLayout::open_ref(image_dir, ref_name)?;
    tracing::info!(
        image = %image_dir.display(),
        manifest = %layout.manifest_digest(),
        dest = %dest.display(),
        "Unpacking image"
    );
    layout.unpack(dest)
}
