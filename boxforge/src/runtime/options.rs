//! Configuration for a `Forge`.

use crate::runtime::constants::envs as const_envs;
use crate::runtime::layout::dirs as const_dirs;
use dirs::home_dir;
use std::path::PathBuf;

/// Options for `Forge::new`.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug)]
pub struct ForgeOptions {
    /// Cache, workspace and log root. Must be absolute.
    pub home_dir: PathBuf,
    /// Registries to search for unqualified base references.
    ///
    /// - Empty list (default): uses docker.io as the implicit default
    /// - Non-empty list: tries each registry in order, first success wins
    /// - Fully qualified refs (e.g., `"quay.io/foo:1.0"`) bypass this list
    ///
    /// ```ignore
    /// ForgeOptions {
    ///     image_registries: vec!["mirror.gcr.io".into(), "docker.io".into()],
    ///     ..Default::default()
    /// }
    /// // "python:3.12" → mirror.gcr.io/library/python:3.12, then docker.io
    /// ```
    pub image_registries: Vec<String>,
}

impl Default for ForgeOptions {
    fn default() -> Self {
        let home_dir = std::env::var(const_envs::BOXFORGE_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::BOXFORGE_DIR);
                path
            });

        Self {
            home_dir,
            image_registries: Vec::new(),
        }
    }
}

impl ForgeOptions {
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            image_registries: Vec::new(),
        }
    }
}
