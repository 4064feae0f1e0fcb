//! Stage 5: populate the dependency manifest.

use crate::assembly::types::LayerStep;
use crate::build::{BuildContext, DependencyManifest, ManifestSpec, image_path_in};
use crate::rootfs::copy_file;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use std::path::{Path, PathBuf};

pub struct ManifestInput<'a> {
    pub context: &'a BuildContext,
    pub spec: &'a ManifestSpec,
    /// Normalised in-image destination file
    pub dest: &'a str,
    pub layer_dir: &'a Path,
}

pub struct ManifestOutput {
    pub step: LayerStep,
    pub manifest: DependencyManifest,
    /// The copy inside the layer, which is what gets installed
    pub copied: PathBuf,
}

pub fn run(input: ManifestInput<'_>) -> BoxforgeResult<ManifestOutput> {
    let src = input.context.resolve(&input.spec.path)?;
    if !src.is_file() {
        return Err(BoxforgeError::Config(format!(
            "Dependency manifest not found: {}",
            input.spec.path.display()
        )));
    }

    let copied = image_path_in(input.layer_dir, input.dest);
    copy_file(&src, &copied)?;
    let manifest = DependencyManifest::load(&copied)?;

    for requirement in manifest.unpinned() {
        tracing::warn!(
            requirement = %requirement.name,
            line = requirement.line,
            "Requirement is not pinned to an exact version; builds may not be reproducible"
        );
    }
    for include in manifest.file_includes() {
        tracing::warn!(
            option = include,
            "Manifest includes another file, which is not copied into the image"
        );
    }

    tracing::info!(
        step = "manifest",
        to = input.dest,
        requirements = manifest.requirements.len(),
        "Dependency manifest copied"
    );

    Ok(ManifestOutput {
        step: LayerStep {
            name: "manifest",
            dir: input.layer_dir.to_path_buf(),
            created_by: format!(
                "boxforge: COPY {} {}",
                input.spec.path.display(),
                input.dest
            ),
            comment: None,
        },
        manifest,
        copied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_and_parses() {
        let ctx = tempfile::tempdir().unwrap();
        std::fs::write(ctx.path().join("requirements.txt"), "requests==2.31.0\nflask>=3\n").unwrap();
        let layer = tempfile::tempdir().unwrap();
        let context = BuildContext::new(ctx.path()).unwrap();

        let out = run(ManifestInput {
            context: &context,
            spec: &ManifestSpec::default(),
            dest: "/requirements.txt",
            layer_dir: layer.path(),
        })
        .unwrap();

        assert_eq!(out.copied, layer.path().join("requirements.txt"));
        assert_eq!(out.manifest.requirements.len(), 2);
        assert_eq!(out.manifest.unpinned().count(), 1);
    }

    #[test]
    fn missing_manifest_is_config_error() {
        let ctx = tempfile::tempdir().unwrap();
        let layer = tempfile::tempdir().unwrap();
        let context = BuildContext::new(ctx.path()).unwrap();

        let err = run(ManifestInput {
            context: &context,
            spec: &ManifestSpec::default(),
            dest: "/requirements.txt",
            layer_dir: layer.path(),
        })
        .err()
        .unwrap();
        assert!(err.is_user_error());
    }
}
