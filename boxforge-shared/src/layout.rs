//! OCI image layout path conventions.
//!
//! Both the base-image reader and the image writer agree on this layout:
//! ```text
//! {root}/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/
//!     └── sha256/
//!         └── {hex}
//! ```

use std::path::{Path, PathBuf};

// ============================================================================
// CONSTANTS
// ============================================================================

/// File and directory names inside an OCI image layout.
pub mod names {
    /// Layout version marker file
    pub const OCI_LAYOUT: &str = "oci-layout";

    /// Entry point listing manifests
    pub const INDEX: &str = "index.json";

    /// Blob root
    pub const BLOBS: &str = "blobs";

    /// Algorithm subdirectory under blobs/
    pub const SHA256: &str = "sha256";
}

// ============================================================================
// OCI LAYOUT PATHS
// ============================================================================

/// Path helper for one OCI image layout directory.
#[derive(Clone, Debug)]
pub struct OciLayoutPaths {
    root: PathBuf,
}

impl OciLayoutPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// {root}/oci-layout
    pub fn oci_layout_file(&self) -> PathBuf {
        self.root.join(names::OCI_LAYOUT)
    }

    /// {root}/index.json
    pub fn index_file(&self) -> PathBuf {
        self.root.join(names::INDEX)
    }

    /// {root}/blobs/sha256
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(names::BLOBS).join(names::SHA256)
    }

    /// Blob path for either `sha256:<hex>` or a bare `<hex>`.
    ///
    /// Returns `None` for other algorithms or hashes containing path
    /// separators, so a crafted digest can never point outside `blobs/`.
    pub fn blob_path(&self, digest_or_hash: &str) -> Option<PathBuf> {
        let hash = digest_or_hash
            .strip_prefix("sha256:")
            .unwrap_or(digest_or_hash);
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.blobs_dir().join(hash))
    }

    /// Create blobs/ and write the oci-layout marker.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.blobs_dir())?;
        std::fs::write(
            self.oci_layout_file(),
            format!(
                "{{\"imageLayoutVersion\":\"{}\"}}",
                crate::constants::oci::IMAGE_LAYOUT_VERSION
            ),
        )
    }
}
