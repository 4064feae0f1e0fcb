//! Base image cache storage.
//!
//! Low-level file operations for cached registry images: manifests and
//! content-addressed blobs, with staged downloads that are verified before
//! they become visible.
//!
//! ```text
//! {images_dir}/
//! ├── refs.json               reference → cached image (ImageIndex)
//! ├── manifests/sha256-{hex}.json
//! └── blobs/sha256/{hex}      layers and configs
//! ```
//!
//! Blobs use the OCI layout naming so a cached image can be read with the
//! same path helper as a local layout.

use boxforge_shared::OciLayoutPaths;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_client::manifest::OciManifest;
use std::path::{Path, PathBuf};

const MANIFESTS_DIR: &str = "manifests";

// ============================================================================
// IMAGE STORAGE
// ============================================================================

pub struct ImageStorage {
    root: PathBuf,
    blobs: OciLayoutPaths,
}

impl std::fmt::Debug for ImageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStorage")
            .field("images_dir", &self.root)
            .finish()
    }
}

impl ImageStorage {
    /// Open (creating if needed) the cache at `images_dir`.
    pub fn new(images_dir: PathBuf) -> BoxforgeResult<Self> {
        let blobs = OciLayoutPaths::new(&images_dir);
        for dir in [images_dir.join(MANIFESTS_DIR), blobs.blobs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            root: images_dir,
            blobs,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &OciLayoutPaths {
        &self.blobs
    }

    // ========================================================================
    // MANIFESTS
    // ========================================================================

    /// Save a manifest under its registry digest. Existing files are kept.
    pub fn save_manifest(&self, manifest: &OciManifest, digest: &str) -> BoxforgeResult<()> {
        let manifest_path = self.manifest_path(digest);
        if manifest_path.exists() {
            tracing::debug!(digest = %digest, "Manifest already cached");
            return Ok(());
        }

        let manifest_json = serde_json::to_string_pretty(manifest)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to serialize manifest: {}", e)))?;

        std::fs::write(&manifest_path, manifest_json).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to write manifest to {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        tracing::debug!(digest = %digest, "Saved manifest");
        Ok(())
    }

    pub fn load_manifest(&self, digest: &str) -> BoxforgeResult<OciManifest> {
        let manifest_path = self.manifest_path(digest);
        let manifest_json = std::fs::read_to_string(&manifest_path).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to read manifest {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&manifest_json)
            .map_err(|e| BoxforgeError::Storage(format!("Failed to parse manifest: {}", e)))
    }

    pub fn has_manifest(&self, digest: &str) -> bool {
        self.manifest_path(digest).exists()
    }

    pub fn manifest_path(&self, digest: &str) -> PathBuf {
        self.root
            .join(MANIFESTS_DIR)
            .join(format!("{}.json", digest.replace(':', "-")))
    }

    // ========================================================================
    // BLOBS
    // ========================================================================

    pub fn blob_path(&self, digest: &str) -> BoxforgeResult<PathBuf> {
        self.blobs
            .blob_path(digest)
            .ok_or_else(|| BoxforgeError::Storage(format!("Invalid blob digest: {}", digest)))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.exists())
    }

    pub fn verify_blobs_exist(&self, digests: &[String]) -> bool {
        digests.iter().all(|d| self.has_blob(d))
    }

    /// Re-hash a cached blob and compare with its name.
    pub async fn verify_blob(&self, digest: &str) -> BoxforgeResult<bool> {
        let path = self.blob_path(digest)?;
        if !path.exists() {
            return Ok(false);
        }

        let expected = digest.to_string();
        let computed = tokio::task::spawn_blocking(move || crate::images::archive::sha256_file(&path))
            .await
            .map_err(|e| BoxforgeError::Internal(format!("Hash task failed: {}", e)))??;

        if computed != expected {
            tracing::error!(
                expected = %expected,
                computed = %computed,
                "Blob integrity check failed"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Start a staged download for a blob.
    ///
    /// Each call gets its own temp file, so parallel downloads of the same
    /// digest do not collide.
    pub async fn stage_blob_download(&self, digest: &str) -> BoxforgeResult<StagedDownload> {
        let expected_hash = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| BoxforgeError::Storage("Invalid digest format, expected sha256:".into()))?
            .to_string();

        let final_path = self.blob_path(digest)?;
        let staged_path = self.blobs.blobs_dir().join(format!(
            "{}.{}.downloading",
            expected_hash,
            ulid::Ulid::new()
        ));

        let file = tokio::fs::File::create(&staged_path).await.map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to create temp file {}: {}",
                staged_path.display(),
                e
            ))
        })?;

        Ok(StagedDownload {
            staged_path,
            final_path,
            expected_hash,
            file,
        })
    }
}

// ============================================================================
// STAGED DOWNLOAD
// ============================================================================

/// An in-progress download with verify-then-rename commit.
pub struct StagedDownload {
    staged_path: PathBuf,
    final_path: PathBuf,
    expected_hash: String,
    file: tokio::fs::File,
}

impl StagedDownload {
    pub fn file(&mut self) -> &mut tokio::fs::File {
        &mut self.file
    }

    /// Verify the content and move it into place.
    ///
    /// Returns `Ok(false)` on a hash mismatch; the temp file is removed.
    pub async fn commit(self) -> BoxforgeResult<bool> {
        use sha2::{Digest, Sha256};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let Self {
            staged_path,
            final_path,
            expected_hash,
            mut file,
        } = self;

        file.flush()
            .await
            .map_err(|e| BoxforgeError::Storage(format!("Failed to flush temp file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| BoxforgeError::Storage(format!("Failed to sync temp file: {}", e)))?;
        drop(file);

        let mut file = tokio::fs::File::open(&staged_path)
            .await
            .map_err(|e| BoxforgeError::Storage(format!("Failed to open temp file: {}", e)))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| BoxforgeError::Storage(format!("Failed to read temp file: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        if hex::encode(hasher.finalize()) != expected_hash {
            let _ = tokio::fs::remove_file(&staged_path).await;
            return Ok(false);
        }

        tokio::fs::rename(&staged_path, &final_path)
            .await
            .map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to move {} to {}: {}",
                    staged_path.display(),
                    final_path.display(),
                    e
                ))
            })?;

        Ok(true)
    }

    /// Drop the temp file without committing.
    pub async fn abort(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.staged_path).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::archive::sha256_bytes;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn new_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let images_dir = temp_dir.path().join("images");

        let storage = ImageStorage::new(images_dir.clone()).unwrap();

        assert!(images_dir.join("manifests").exists());
        assert!(images_dir.join("blobs/sha256").exists());
        assert_eq!(storage.images_dir(), images_dir);
    }

    #[test]
    fn manifest_path_uses_dash_separator() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();

        assert_eq!(
            storage.manifest_path("sha256:abc123"),
            temp_dir.path().join("manifests/sha256-abc123.json")
        );
    }

    #[test]
    fn blob_path_rejects_bad_digests() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(storage.blob_path("sha256:../../etc").is_err());
        assert!(!storage.has_blob("sha256:abc"));
    }

    #[tokio::test]
    async fn staged_download_commits_verified_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();
        let digest = sha256_bytes(b"layer data");

        let mut staged = storage.stage_blob_download(&digest).await.unwrap();
        staged.file().write_all(b"layer data").await.unwrap();
        assert!(staged.commit().await.unwrap());

        assert!(storage.has_blob(&digest));
        assert!(storage.verify_blob(&digest).await.unwrap());
        assert!(storage.verify_blobs_exist(&[digest]));
    }

    #[tokio::test]
    async fn staged_download_rejects_mismatch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();
        let digest = sha256_bytes(b"expected");

        let mut staged = storage.stage_blob_download(&digest).await.unwrap();
        staged.file().write_all(b"tampered").await.unwrap();
        assert!(!staged.commit().await.unwrap());

        assert!(!storage.has_blob(&digest));
        let leftovers = std::fs::read_dir(storage.blobs().blobs_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
