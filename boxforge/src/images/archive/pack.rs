//! Deterministic layer packing.
//!
//! A layer directory becomes a gzip-compressed tar blob whose bytes depend
//! only on the directory content: entries are emitted in sorted walk order,
//! ownership is root, every mtime is the build epoch and the gzip header
//! carries no timestamp or file name.

use super::digest::HashingWriter;
use boxforge_shared::OciLayoutPaths;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use flate2::{Compression, GzBuilder};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};
use walkdir::WalkDir;

/// A layer blob written into an image layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedLayer {
    /// Digest of the compressed blob (manifest descriptor)
    pub digest: String,
    /// Digest of the uncompressed tar (config rootfs)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
    pub entries: usize,
}

/// True when `dir` has no entries (or does not exist).
pub fn is_empty_layer(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Pack `layer_dir` into `blobs`, stamping every entry with `mtime`.
pub fn pack_layer(layer_dir: &Path, blobs: &OciLayoutPaths, mtime: u64) -> BoxforgeResult<PackedLayer> {
    let blobs_dir = blobs.blobs_dir();
    let staged = tempfile::NamedTempFile::new_in(&blobs_dir).map_err(|e| {
        BoxforgeError::Storage(format!(
            "Failed to create temp blob in {}: {}",
            blobs_dir.display(),
            e
        ))
    })?;

    let compressed = HashingWriter::new(staged);
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(compressed, Compression::default());
    let uncompressed = HashingWriter::new(encoder);

    let mut builder = tar::Builder::new(uncompressed);
    builder.mode(tar::HeaderMode::Deterministic);
    let entries = append_tree(&mut builder, layer_dir, mtime)?;

    let uncompressed = builder
        .into_inner()
        .map_err(|e| BoxforgeError::Storage(format!("Failed to finish layer tar: {}", e)))?;
    let (encoder, diff_id, _) = uncompressed.finish();
    let compressed = encoder
        .finish()
        .map_err(|e| BoxforgeError::Storage(format!("Failed to finish layer gzip: {}", e)))?;
    let (mut staged, digest, size) = compressed.finish();

    staged
        .flush()
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| BoxforgeError::Storage(format!("Failed to sync layer blob: {}", e)))?;

    let final_path = blobs.blob_path(&digest).ok_or_else(|| {
        BoxforgeError::Internal(format!("Computed digest is not a valid blob name: {}", digest))
    })?;
    if final_path.exists() {
        tracing::debug!(digest = %digest, "Layer blob already present");
    } else {
        staged.persist(&final_path).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to move layer blob to {}: {}",
                final_path.display(),
                e.error
            ))
        })?;
    }

    tracing::debug!(
        layer = %layer_dir.display(),
        digest = %digest,
        diff_id = %diff_id,
        size,
        entries,
        "Packed layer"
    );

    Ok(PackedLayer {
        digest,
        diff_id,
        size,
        entries,
    })
}

/// Pack several layer directories concurrently, preserving input order.
pub fn pack_layers(layer_dirs: &[PathBuf], blobs: &OciLayoutPaths, mtime: u64) -> BoxforgeResult<Vec<PackedLayer>> {
    use rayon::prelude::*;

    layer_dirs
        .par_iter()
        .map(|dir| pack_layer(dir, blobs, mtime))
        .collect()
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, root: &Path, mtime: u64) -> BoxforgeResult<usize> {
    let mut first_seen: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut count = 0;

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            BoxforgeError::Storage(format!("Failed to walk layer {}: {}", root.display(), e))
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(root).map_err(|e| {
            BoxforgeError::Internal(format!("Failed to rebase path {}: {}", path.display(), e))
        })?;
        let meta = fs::symlink_metadata(path).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to stat {}: {}", path.display(), e))
        })?;

        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(mtime);
        header.set_mode(meta.permissions().mode() & 0o7777);

        let file_type = meta.file_type();
        let result = if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| {
                BoxforgeError::Storage(format!("Failed to read symlink {}: {}", path.display(), e))
            })?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)
        } else if file_type.is_file() {
            let key = (meta.dev(), meta.ino());
            if meta.nlink() > 1
                && let Some(first) = first_seen.get(&key)
            {
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                builder.append_link(&mut header, rel, first)
            } else {
                if meta.nlink() > 1 {
                    first_seen.insert(key, rel.to_path_buf());
                }
                header.set_entry_type(EntryType::Regular);
                header.set_size(meta.len());
                let file = fs::File::open(path).map_err(|e| {
                    BoxforgeError::Storage(format!("Failed to open {}: {}", path.display(), e))
                })?;
                builder.append_data(&mut header, rel, file)
            }
        } else {
            tracing::warn!(path = %path.display(), "Skipping special file in layer");
            continue;
        };

        result.map_err(|e| {
            BoxforgeError::Storage(format!("Failed to add {} to layer: {}", rel.display(), e))
        })?;
        count += 1;
    }

    Ok(count)
}
