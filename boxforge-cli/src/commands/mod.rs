pub mod build;
pub mod inspect;
pub mod pull;
pub mod unpack;
pub mod validate;

use anyhow::Context;
use boxforge::{BuildContext, BuildSpec};
use boxforge_shared::constants::defaults;
use clap::Args;
use std::path::{Path, PathBuf};

/// Build file and context selection shared by `build` and `validate`.
#[derive(Args, Debug)]
pub struct BuildFileArgs {
    /// Build file (default: boxforge.yaml in the context)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Build context directory (default: the build file's directory, or
    /// the current directory)
    #[arg(long)]
    pub context: Option<PathBuf>,
}

impl BuildFileArgs {
    pub fn context_dir(&self) -> PathBuf {
        match (&self.context, &self.file) {
            (Some(context), _) => context.clone(),
            (None, Some(file)) => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            (None, None) => PathBuf::from("."),
        }
    }

    pub fn load(&self) -> anyhow::Result<(BuildSpec, BuildContext)> {
        let dir = self.context_dir();
        let context = BuildContext::new(&dir)
            .with_context(|| format!("Invalid build context {}", dir.display()))?;

        let file = match &self.file {
            Some(file) => file.clone(),
            None => context.root().join(defaults::BUILD_FILE),
        };
        let spec = BuildSpec::load(&file)
            .with_context(|| format!("Failed to load build file {}", file.display()))?;

        tracing::debug!(file = %file.display(), context = %context.root().display(), "Loaded build file");
        Ok((spec, context))
    }
}

/// `12.3 MB` style sizes.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Fail unless `dest` is absent or an empty directory.
pub fn ensure_empty_dir(dest: &Path) -> anyhow::Result<()> {
    if dest.exists() {
        let mut entries = std::fs::read_dir(dest)
            .with_context(|| format!("{} is not a readable directory", dest.display()))?;
        if entries.next().is_some() {
            anyhow::bail!("Destination {} is not empty", dest.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_defaults_to_build_file_dir() {
        let args = |file: Option<&str>, context: Option<&str>| BuildFileArgs {
            file: file.map(PathBuf::from),
            context: context.map(PathBuf::from),
        };
        assert_eq!(args(None, None).context_dir(), PathBuf::from("."));
        assert_eq!(args(Some("boxforge.yaml"), None).context_dir(), PathBuf::from("."));
        assert_eq!(args(Some("apps/web/build.yaml"), None).context_dir(), PathBuf::from("apps/web"));
        assert_eq!(args(Some("apps/web/build.yaml"), Some("src")).context_dir(), PathBuf::from("src"));
    }

    #[test]
    fn sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1_500), "1.5 KB");
        assert_eq!(human_size(48_200_000), "48.2 MB");
    }
}
