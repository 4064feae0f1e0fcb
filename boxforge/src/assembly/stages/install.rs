//! Stage 6: install dependencies into their own layer.

use crate::assembly::types::LayerStep;
use crate::build::DependencyManifest;
use crate::install::{
    InstallOptions, InstallReport, InstallRequest, InstallTarget, PackageInstaller,
    install_with_retry,
};
use boxforge_shared::errors::BoxforgeResult;
use oci_spec::image::ImageConfiguration;
use std::path::Path;

pub struct InstallInput<'a> {
    pub installer: &'a dyn PackageInstaller,
    pub options: &'a InstallOptions,
    /// Base image config; decides the target interpreter and platform
    pub base: &'a ImageConfiguration,
    pub manifest: &'a DependencyManifest,
    /// Host path of the manifest copy
    pub manifest_path: &'a Path,
    /// In-image manifest path, for history
    pub manifest_dest: &'a str,
    pub layer_dir: &'a Path,
    pub source_date_epoch: u64,
}

pub struct InstallOutput {
    pub step: LayerStep,
    /// `None` when there was nothing to install
    pub report: Option<InstallReport>,
}

pub async fn run(input: InstallInput<'_>) -> BoxforgeResult<InstallOutput> {
    let created_by = format!(
        "boxforge: RUN {} install -r {}",
        input.installer.name(),
        input.manifest_dest
    );

    if input.manifest.requirements.is_empty() && input.manifest.options.is_empty() {
        tracing::info!(step = "install", "Dependency manifest is empty, nothing to install");
        return Ok(InstallOutput {
            step: LayerStep {
                name: "dependencies",
                dir: input.layer_dir.to_path_buf(),
                created_by,
                comment: Some("no dependencies".into()),
            },
            report: None,
        });
    }

    let target = InstallTarget::resolve(input.options, input.base)?;
    tracing::debug!(
        step = "install",
        python_version = %target.python_version,
        platform = %target.platform,
        "Resolved install target"
    );

    let request = InstallRequest {
        manifest: input.manifest_path.to_path_buf(),
        root: input.layer_dir.to_path_buf(),
        prefix: input.options.prefix.clone(),
        target,
        source_date_epoch: input.source_date_epoch,
    };

    let report = install_with_retry(input.installer, &request, input.options).await?;

    tracing::info!(
        step = "install",
        installer = %report.installer,
        attempts = report.attempts,
        requirements = input.manifest.requirements.len(),
        elapsed_ms = report.duration.as_millis() as u64,
        "Dependencies installed"
    );

    Ok(InstallOutput {
        step: LayerStep {
            name: "dependencies",
            dir: input.layer_dir.to_path_buf(),
            created_by,
            comment: Some(format!("{} requirements", input.manifest.requirements.len())),
        },
        report: Some(report),
    })
}
