//! The `Forge` entry point.

use std::path::Path;
use std::sync::Arc;

use crate::assembly::{Assembly, AssemblyReport, AssemblyRequest};
use crate::images::{BaseImage, ImageStore, PinnedReference};
use crate::install::{PackageInstaller, PipInstaller};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::RuntimeLock;
use crate::runtime::options::ForgeOptions;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};

/// Owns a home directory: the base image cache and the build workspaces.
///
/// **Lock Behavior**: Only one `Forge` can use a given `BOXFORGE_HOME`
/// directory at a time. The filesystem lock is released when the last clone
/// is dropped.
///
/// **Cloning**: cheap, all clones share the same state.
#[derive(Clone)]
pub struct Forge {
    inner: Arc<ForgeInner>,
}

struct ForgeInner {
    layout: FilesystemLayout,
    images: Arc<ImageStore>,
    _lock: RuntimeLock,
}

impl std::fmt::Debug for Forge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forge")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}

impl Forge {
    /// Open (creating if needed) the home directory in `options`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `home_dir` is not absolute
    /// - Another process is already using the same home directory
    /// - The directory structure or image cache cannot be created
    pub fn new(options: ForgeOptions) -> BoxforgeResult<Self> {
        if !options.home_dir.is_absolute() {
            return Err(BoxforgeError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        let lock = RuntimeLock::acquire(layout.home_dir())?;

        // Holding the lock, so nothing else can be using these.
        layout.sweep_stale_builds();

        let images = ImageStore::new(layout.images_dir(), options.image_registries)?;

        tracing::debug!(home = %layout.home_dir().display(), "Initialized forge");

        Ok(Self {
            inner: Arc::new(ForgeInner {
                layout,
                images: Arc::new(images),
                _lock: lock,
            }),
        })
    }

    /// Create a forge with default options.
    pub fn with_defaults() -> BoxforgeResult<Self> {
        Self::new(ForgeOptions::default())
    }

    pub fn home_dir(&self) -> &Path {
        self.inner.layout.home_dir()
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    pub fn images(&self) -> &ImageStore {
        &self.inner.images
    }

    /// Prepare an assembly installing dependencies with pip, as configured
    /// by the build file's `install` section.
    pub fn assembly(&self, request: AssemblyRequest) -> Assembly {
        let installer = Arc::new(PipInstaller::new(&request.spec.install));
        self.assembly_with_installer(request, installer)
    }

    /// Prepare an assembly with a custom installer.
    pub fn assembly_with_installer(
        &self,
        request: AssemblyRequest,
        installer: Arc<dyn PackageInstaller>,
    ) -> Assembly {
        Assembly::new(
            request,
            self.inner.layout.builds_dir(),
            Arc::clone(&self.inner.images),
            installer,
        )
    }

    /// Run a pip-backed assembly to completion.
    pub async fn build(&self, request: AssemblyRequest) -> BoxforgeResult<AssemblyReport> {
        self.assembly(request).run().await
    }

    /// Resolve a pinned registry reference into the local cache.
    pub async fn pull(&self, reference: &str) -> BoxforgeResult<BaseImage> {
        let reference = PinnedReference::parse(reference)?;
        self.inner.images.pull(&reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_home() {
        let err = Forge::new(ForgeOptions::with_home("relative/home")).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn second_forge_on_same_home_fails() {
        let home = tempfile::tempdir().unwrap();
        let forge = Forge::new(ForgeOptions::with_home(home.path())).unwrap();
        assert!(forge.layout().builds_dir().is_dir());

        let err = Forge::new(ForgeOptions::with_home(home.path())).unwrap_err();
        assert!(matches!(err, BoxforgeError::Internal(_)));

        drop(forge);
        Forge::new(ForgeOptions::with_home(home.path())).unwrap();
    }

    #[tokio::test]
    async fn pull_rejects_unpinned_reference_offline() {
        let home = tempfile::tempdir().unwrap();
        let forge = Forge::new(ForgeOptions::with_home(home.path())).unwrap();

        for reference in ["python", "python:latest", "python:slim"] {
            let err = forge.pull(reference).await.unwrap_err();
            assert!(err.is_user_error(), "{reference}: {err}");
        }
    }
}
