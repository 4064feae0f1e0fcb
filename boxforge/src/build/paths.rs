//! Path validation for build inputs and in-image destinations.
//!
//! Inputs are always relative to the build context root and may not climb out
//! of it. Destinations are absolute paths inside the image, normalised to a
//! canonical `/a/b` form.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use std::path::{Component, Path, PathBuf};

/// Root directory that all build inputs are resolved against.
#[derive(Clone, Debug)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    /// Create a context rooted at `root`.
    ///
    /// The root must exist and be a directory. It is canonicalised so that
    /// later containment checks compare like with like.
    pub fn new(root: impl AsRef<Path>) -> BoxforgeResult<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            BoxforgeError::Config(format!(
                "Build context {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;

        if !canonical.is_dir() {
            return Err(BoxforgeError::Config(format!(
                "Build context is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a context-relative input path.
    ///
    /// Rejects absolute paths and any `..` component. Existence is not
    /// checked here; the assembly step owning the input decides whether a
    /// missing path is fatal.
    pub fn resolve(&self, relative: &Path) -> BoxforgeResult<PathBuf> {
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(BoxforgeError::Config(format!(
                        "Input path '{}' escapes the build context",
                        relative.display()
                    )));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(BoxforgeError::Config(format!(
                        "Input path '{}' must be relative to the build context",
                        relative.display()
                    )));
                }
            }
        }

        Ok(resolved)
    }
}

/// Normalise an absolute in-image path.
///
/// `"/src/"` → `"/src"`, `"/a/./b"` → `"/a/b"`, `"/"` → `"/"`.
/// Relative paths and `..` components are rejected.
pub fn normalize_image_path(path: &str) -> BoxforgeResult<String> {
    if !path.starts_with('/') {
        return Err(BoxforgeError::Config(format!(
            "Image path '{}' must be absolute",
            path
        )));
    }

    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(BoxforgeError::Config(format!(
                    "Image path '{}' must not contain '..'",
                    path
                )));
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Map a normalised image path onto a host directory standing in for `/`.
pub fn image_path_in(root: &Path, image_path: &str) -> PathBuf {
    let relative = image_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
