//! Assembly types: state machine, build workspace and cleanup guard.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Last completed step of an assembly.
///
/// Transitions are forward-only. After a failure the state is left at the
/// last step that succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyState {
    #[default]
    NotStarted,
    BaseSelected,
    SourceCopied,
    ConfigCopied,
    EnvCopied,
    ManifestCopied,
    DependenciesInstalled,
    EntrypointSet,
}

impl AssemblyState {
    /// The state reached by completing the next step, `None` at the end.
    pub fn next(self) -> Option<Self> {
        use AssemblyState::*;
        match self {
            NotStarted => Some(BaseSelected),
            BaseSelected => Some(SourceCopied),
            SourceCopied => Some(ConfigCopied),
            ConfigCopied => Some(EnvCopied),
            EnvCopied => Some(ManifestCopied),
            ManifestCopied => Some(DependenciesInstalled),
            DependenciesInstalled => Some(EntrypointSet),
            EntrypointSet => None,
        }
    }

    pub fn is_complete(self) -> bool {
        self == AssemblyState::EntrypointSet
    }

    pub fn as_str(self) -> &'static str {
        use AssemblyState::*;
        match self {
            NotStarted => "not_started",
            BaseSelected => "base_selected",
            SourceCopied => "source_copied",
            ConfigCopied => "config_copied",
            EnvCopied => "env_copied",
            ManifestCopied => "manifest_copied",
            DependenciesInstalled => "dependencies_installed",
            EntrypointSet => "entrypoint_set",
        }
    }
}

impl fmt::Display for AssemblyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filesystem layer produced by a step.
#[derive(Clone, Debug)]
pub struct LayerStep {
    /// Step name, e.g. `source`
    pub name: &'static str,
    /// Directory standing for the image root of this layer
    pub dir: PathBuf,
    /// History `created_by` text. Must not contain host paths.
    pub created_by: String,
    pub comment: Option<String>,
}

/// Per-step timing, reported after a successful build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepTiming {
    pub state: AssemblyState,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ============================================================================
// BUILD WORKSPACE
// ============================================================================

/// Scratch directory of one build.
///
/// ```text
/// <home>/builds/<build-id>/
/// └── layers/
///     ├── 1-source/
///     ├── 2-config/
///     ├── 3-env/
///     ├── 4-manifest/
///     └── 5-dependencies/
/// ```
#[derive(Clone, Debug)]
pub struct BuildWorkspace {
    id: String,
    root: PathBuf,
}

impl BuildWorkspace {
    /// Create a fresh workspace with a new build id under `builds_dir`.
    pub fn create(builds_dir: &Path) -> BoxforgeResult<Self> {
        let id = ulid::Ulid::new().to_string();
        let root = builds_dir.join(&id);
        std::fs::create_dir_all(root.join("layers")).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to create build workspace {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { id, root })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Empty layer directory for step `name`, created on demand.
    pub fn layer_dir(&self, order: u8, name: &str) -> BoxforgeResult<PathBuf> {
        let dir = self.root.join("layers").join(format!("{}-{}", order, name));
        std::fs::create_dir_all(&dir).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to create layer directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    pub fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// CLEANUP GUARD
// ============================================================================

/// RAII guard removing build leftovers unless disarmed.
///
/// The workspace is always removed on drop; a registered staging
/// directory only while armed.
pub struct CleanupGuard {
    workspace: Option<BuildWorkspace>,
    staging: Option<PathBuf>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(workspace: BuildWorkspace) -> Self {
        Self {
            workspace: Some(workspace),
            staging: None,
            armed: true,
        }
    }

    /// Register a partially written output for removal on failure.
    pub fn set_staging(&mut self, staging: PathBuf) {
        self.staging = Some(staging);
    }

    /// Disarm the guard (call on success).
    ///
    /// The workspace is still removed on drop, but the failure is not
    /// reported and staged output is left alone.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Image assembly failed, cleaning up");

            if let Some(staging) = self.staging.take()
                && staging.exists()
                && let Err(e) = std::fs::remove_dir_all(&staging)
            {
                tracing::warn!(
                    path = %staging.display(),
                    "Failed to remove staged output during cleanup: {}",
                    e
                );
            }
        }

        if let Some(workspace) = self.workspace.take()
            && let Err(e) = workspace.remove()
        {
            tracing::warn!(
                path = %workspace.root().display(),
                "Failed to remove build workspace: {}",
                e
            );
        }
    }
}
