//! Reference index for the base image cache.
//!
//! Maps the references written in build files to cached manifests, so a
//! repeated build resolves its base without touching the registry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};

const INDEX_FILE: &str = "refs.json";

/// Index of locally cached images.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageIndex {
    /// Schema version for future compatibility
    pub version: String,

    /// Reference as written (e.g. `python:3.12.4-slim`) → cached image
    pub images: BTreeMap<String, CachedImage>,
}

/// Metadata for one cached image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// Fully expanded reference the image was pulled from
    pub resolved: String,

    /// Platform manifest digest (sha256:...)
    pub manifest_digest: String,

    pub config_digest: String,

    /// Layer digests, bottom to top
    pub layers: Vec<String>,

    /// When the image was cached (RFC 3339)
    pub cached_at: String,

    /// Whether all blobs were downloaded and verified
    pub complete: bool,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            images: BTreeMap::new(),
        }
    }

    /// Load the index from `images_dir`.
    ///
    /// A missing or unreadable index yields an empty one: the cache then
    /// refills from the registry.
    pub fn load(images_dir: &Path) -> Self {
        let index_path = images_dir.join(INDEX_FILE);

        if !index_path.exists() {
            tracing::debug!("Index file not found, starting empty");
            return Self::new();
        }

        match std::fs::read_to_string(&index_path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(index) => {
                    tracing::debug!(images = index.len(), "Loaded image index");
                    index
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Corrupted image index, starting empty");
                    Self::new()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read image index, starting empty");
                Self::new()
            }
        }
    }

    /// Write the index, replacing the previous file atomically.
    pub fn save(&self, images_dir: &Path) -> BoxforgeResult<()> {
        let index_path = images_dir.join(INDEX_FILE);

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to serialize index: {e}")))?;

        let tmp = tempfile::NamedTempFile::new_in(images_dir)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to create temp index: {e}")))?;
        std::fs::write(tmp.path(), json)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to write index: {e}")))?;
        tmp.persist(&index_path)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to replace index: {}", e.error)))?;

        tracing::debug!(images = self.images.len(), "Saved image index");
        Ok(())
    }

    pub fn get(&self, reference: &str) -> Option<&CachedImage> {
        self.images.get(reference)
    }

    pub fn upsert(&mut self, reference: String, image: CachedImage) {
        self.images.insert(reference, image);
    }

    pub fn remove(&mut self, reference: &str) -> Option<CachedImage> {
        self.images.remove(reference)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
