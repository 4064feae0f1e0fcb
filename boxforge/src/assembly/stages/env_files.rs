//! Stage 4: populate environment files.
//!
//! Files directly under the build context root whose names match the
//! pattern are copied to `dest`. No match is a normal outcome.

use crate::assembly::types::LayerStep;
use crate::build::{BuildContext, EnvFilesSpec, image_path_in};
use crate::rootfs::{FilePattern, copy_file};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use std::path::Path;

pub struct EnvFilesInput<'a> {
    pub context: &'a BuildContext,
    pub spec: &'a EnvFilesSpec,
    /// Normalised in-image destination directory
    pub dest: &'a str,
    pub layer_dir: &'a Path,
}

pub struct EnvFilesOutput {
    pub step: LayerStep,
    /// Copied file names, sorted
    pub files: Vec<String>,
}

pub fn run(input: EnvFilesInput<'_>) -> BoxforgeResult<EnvFilesOutput> {
    let pattern = FilePattern::new(&input.spec.pattern)?;
    let matches = pattern.collect(input.context.root())?;
    let dest_dir = image_path_in(input.layer_dir, input.dest);

    let mut files = Vec::with_capacity(matches.len());
    for path in &matches {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                BoxforgeError::Internal(format!("Unexpected env file path {}", path.display()))
            })?;
        copy_file(path, &dest_dir.join(name))?;
        files.push(name.to_string());
    }

    if files.is_empty() {
        tracing::info!(
            step = "env_files",
            pattern = pattern.as_str(),
            "No environment files matched"
        );
    } else {
        tracing::info!(
            step = "env_files",
            pattern = pattern.as_str(),
            count = files.len(),
            files = ?files,
            "Environment files copied"
        );
    }

    let comment = if files.is_empty() {
        Some("no matching files".to_string())
    } else {
        Some(files.join(" "))
    };

    Ok(EnvFilesOutput {
        step: LayerStep {
            name: "env_files",
            dir: input.layer_dir.to_path_buf(),
            created_by: format!("boxforge: COPY {} {}", pattern.as_str(), input.dest),
            comment,
        },
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::archive::is_empty_layer;

    fn run_in(ctx: &Path, layer: &Path) -> EnvFilesOutput {
        let context = BuildContext::new(ctx).unwrap();
        run(EnvFilesInput {
            context: &context,
            spec: &EnvFilesSpec::default(),
            dest: "/",
            layer_dir: layer,
        })
        .unwrap()
    }

    #[test]
    fn copies_matching_files_only() {
        let ctx = tempfile::tempdir().unwrap();
        std::fs::write(ctx.path().join(".env"), "A=1\n").unwrap();
        std::fs::write(ctx.path().join(".env.production"), "A=2\n").unwrap();
        std::fs::write(ctx.path().join("boxforge.yaml"), "").unwrap();
        std::fs::create_dir(ctx.path().join(".envs")).unwrap();
        let layer = tempfile::tempdir().unwrap();

        let out = run_in(ctx.path(), layer.path());

        assert_eq!(out.files, vec![".env", ".env.production"]);
        assert_eq!(std::fs::read_to_string(layer.path().join(".env")).unwrap(), "A=1\n");
        assert!(!layer.path().join("boxforge.yaml").exists());
        assert!(!layer.path().join(".envs").exists());
    }

    #[test]
    fn zero_matches_leaves_layer_empty() {
        let ctx = tempfile::tempdir().unwrap();
        std::fs::write(ctx.path().join("requirements.txt"), "").unwrap();
        let layer = tempfile::tempdir().unwrap();

        let out = run_in(ctx.path(), layer.path());

        assert!(out.files.is_empty());
        assert!(is_empty_layer(layer.path()));
        assert_eq!(out.step.comment.as_deref(), Some("no matching files"));
    }
}
