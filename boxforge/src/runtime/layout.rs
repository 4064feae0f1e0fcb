use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for BoxForge data
    pub const BOXFORGE_DIR: &str = ".boxforge";

    /// Base image cache (manifests, blobs, refs.json)
    pub const IMAGES_DIR: &str = "images";

    /// Per-build scratch workspaces
    pub const BUILDS_DIR: &str = "builds";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Layout of a BoxForge home directory.
///
/// ```text
/// ~/.boxforge/
/// ├── .lock
/// ├── images/
/// │   ├── refs.json
/// │   ├── manifests/
/// │   └── blobs/sha256/
/// ├── builds/
/// │   └── {build_id}/     # removed when the build ends
/// └── logs/
///     └── boxforge.log.YYYY-MM-DD
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES_DIR)
    }

    /// Root directory for build workspaces: ~/.boxforge/builds
    pub fn builds_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::BUILDS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    /// Initialize the filesystem structure.
    pub fn prepare(&self) -> BoxforgeResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| BoxforgeError::Storage(format!("failed to create home: {e}")))?;

        std::fs::create_dir_all(self.images_dir())
            .map_err(|e| BoxforgeError::Storage(format!("failed to create images dir: {e}")))?;

        std::fs::create_dir_all(self.builds_dir())
            .map_err(|e| BoxforgeError::Storage(format!("failed to create builds dir: {e}")))?;

        std::fs::create_dir_all(self.logs_dir())
            .map_err(|e| BoxforgeError::Storage(format!("failed to create logs dir: {e}")))?;

        Ok(())
    }

    /// Remove build workspaces left behind by a crashed process.
    ///
    /// Only safe while holding the home lock.
    pub fn sweep_stale_builds(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(self.builds_dir()) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    "Failed to remove stale build workspace: {}",
                    e
                ),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed stale build workspaces");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_directories() {
        let home = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(home.path().join("forge"));
        layout.prepare().unwrap();

        assert!(layout.images_dir().is_dir());
        assert!(layout.builds_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.builds_dir().ends_with("forge/builds"));
    }

    #[test]
    fn sweep_removes_leftover_builds() {
        let home = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(home.path().to_path_buf());
        layout.prepare().unwrap();
        std::fs::create_dir_all(layout.builds_dir().join("01STALE/layers")).unwrap();

        assert_eq!(layout.sweep_stale_builds(), 1);
        assert_eq!(std::fs::read_dir(layout.builds_dir()).unwrap().count(), 0);
    }
}
