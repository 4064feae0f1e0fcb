//! The assembly procedure.

use super::export::{self, ExportInput};
use super::stages::{
    base::{self, BaseInput},
    config, entrypoint,
    entrypoint::EntrypointInput,
    env_files::{self, EnvFilesInput},
    install::{self, InstallInput},
    manifest::{self, ManifestInput},
    source::{self, TreeInput},
};
use super::types::{AssemblyState, BuildWorkspace, CleanupGuard, LayerStep, StepTiming};
use crate::build::{BuildContext, BuildSpec};
use crate::images::ImageStore;
use crate::install::{InstallReport, PackageInstaller};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Everything one build needs from the caller.
#[derive(Clone, Debug)]
pub struct AssemblyRequest {
    pub spec: BuildSpec,
    pub context: BuildContext,
    /// Directory the OCI image layout is written to
    pub output: PathBuf,
    /// Written as the `org.opencontainers.image.ref.name` annotation
    pub tag: Option<String>,
}

/// Summary of a successful build.
#[derive(Clone, Debug, Serialize)]
pub struct AssemblyReport {
    pub build_id: String,
    pub output: PathBuf,
    pub tag: Option<String>,
    pub manifest_digest: String,
    pub config_digest: String,
    pub base: String,
    pub entry: Vec<String>,
    pub env_files: Vec<String>,
    pub base_layers: usize,
    pub new_layers: usize,
    #[serde(skip)]
    pub install: Option<InstallReport>,
    pub timings: Vec<StepTiming>,
}

/// One run of the seven-step assembly.
///
/// # Example
///
/// ```ignore
/// let mut assembly = forge.assembly(request);
/// match assembly.run().await {
///     Ok(report) => println!("{}", report.manifest_digest),
///     Err(e) => eprintln!("stopped after {}: {}", assembly.state(), e),
/// }
/// ```
pub struct Assembly {
    request: AssemblyRequest,
    builds_dir: PathBuf,
    images: Arc<ImageStore>,
    installer: Arc<dyn PackageInstaller>,
    state: AssemblyState,
    started: bool,
}

impl std::fmt::Debug for Assembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembly")
            .field("output", &self.request.output)
            .field("installer", &self.installer.name())
            .field("state", &self.state)
            .finish()
    }
}

impl Assembly {
    pub fn new(
        request: AssemblyRequest,
        builds_dir: PathBuf,
        images: Arc<ImageStore>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            request,
            builds_dir,
            images,
            installer,
            state: AssemblyState::NotStarted,
            started: false,
        }
    }

    /// Last completed step.
    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Run all steps in order.
    ///
    /// Fails fast with no retry. On failure the build workspace is removed,
    /// nothing is written at the output path and `state()` tells which step
    /// completed last. An assembly runs at most once.
    pub async fn run(&mut self) -> BoxforgeResult<AssemblyReport> {
        if self.started {
            return Err(BoxforgeError::InvalidState(format!(
                "assembly already ran (state: {})",
                self.state
            )));
        }
        self.started = true;

        self.request.spec.validate()?;
        let output = std::path::absolute(&self.request.output).map_err(|e| {
            BoxforgeError::Config(format!(
                "Invalid output path {}: {}",
                self.request.output.display(),
                e
            ))
        })?;
        export::check_output(&output)?;

        let workspace = BuildWorkspace::create(&self.builds_dir)?;
        let span = tracing::info_span!("assembly", build_id = %workspace.id());
        let guard = CleanupGuard::new(workspace.clone());

        let request = &self.request;
        let images = self.images.as_ref();
        let installer = self.installer.as_ref();
        let state = &mut self.state;

        run_steps(request, &output, images, installer, &workspace, guard, state)
            .instrument(span)
            .await
    }
}

async fn run_steps(
    request: &AssemblyRequest,
    output: &Path,
    images: &ImageStore,
    installer: &dyn PackageInstaller,
    workspace: &BuildWorkspace,
    mut guard: CleanupGuard,
    state: &mut AssemblyState,
) -> BoxforgeResult<AssemblyReport> {
    let spec = &request.spec;
    let context = &request.context;
    let mut progress = Progress::new(state);

    tracing::info!(
        context = %context.root().display(),
        output = %output.display(),
        entry = %spec.entry,
        "Starting image assembly"
    );

    // 1. Base runtime
    let base_image = base::run(BaseInput {
        spec,
        context,
        images,
    })
    .await?;
    progress.complete(AssemblyState::BaseSelected);

    let mut layers: Vec<LayerStep> = Vec::with_capacity(5);

    // 2. Source tree
    let source_dest = spec.source_dest()?;
    let source_dir = workspace.layer_dir(1, "source")?;
    layers.push(source::run(TreeInput {
        context,
        tree: &spec.source,
        dest: &source_dest,
        layer_dir: &source_dir,
    })?);
    progress.complete(AssemblyState::SourceCopied);

    // 3. Configuration tree
    let config_dest = spec.config_dest()?;
    let config_input = match (&spec.config, &config_dest) {
        (Some(tree), Some(dest)) => Some((tree, dest, workspace.layer_dir(2, "config")?)),
        _ => None,
    };
    let config_step = config::run(config_input.as_ref().map(|(tree, dest, dir)| TreeInput {
        context,
        tree,
        dest: dest.as_str(),
        layer_dir: dir,
    }))?;
    layers.extend(config_step);
    progress.complete(AssemblyState::ConfigCopied);

    // 4. Environment files
    let env_dest = spec.env_files_dest()?;
    let env_dir = workspace.layer_dir(3, "env")?;
    let env = env_files::run(EnvFilesInput {
        context,
        spec: &spec.env_files,
        dest: &env_dest,
        layer_dir: &env_dir,
    })?;
    layers.push(env.step);
    progress.complete(AssemblyState::EnvCopied);

    // 5. Dependency manifest
    let manifest_dest = spec.manifest_dest()?;
    let manifest_dir = workspace.layer_dir(4, "manifest")?;
    let manifest = manifest::run(ManifestInput {
        context,
        spec: &spec.dependencies,
        dest: &manifest_dest,
        layer_dir: &manifest_dir,
    })?;
    layers.push(manifest.step);
    progress.complete(AssemblyState::ManifestCopied);

    // 6. Dependencies
    let deps_dir = workspace.layer_dir(5, "dependencies")?;
    let installed = install::run(InstallInput {
        installer,
        options: &spec.install,
        base: &base_image.config,
        manifest: &manifest.manifest,
        manifest_path: &manifest.copied,
        manifest_dest: &manifest_dest,
        layer_dir: &deps_dir,
        source_date_epoch: spec.source_date_epoch,
    })
    .await?;
    layers.push(installed.step);
    progress.complete(AssemblyState::DependenciesInstalled);

    // 7. Entry command, then the image itself
    let entry = entrypoint::run(EntrypointInput {
        spec,
        base: &base_image,
        layers: &layers,
    })?;

    let staging = export::staging_path(output, workspace.id())?;
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to create output directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    guard.set_staging(staging.clone());

    let exported = export::run(ExportInput {
        base: &base_image,
        layers: &layers,
        settings: &entry.settings,
        entry_history: &entry.history,
        staging: &staging,
        output,
        tag: request.tag.as_deref(),
        source_date_epoch: spec.source_date_epoch,
    })?;
    progress.complete(AssemblyState::EntrypointSet);

    guard.disarm();
    drop(guard);

    let timings = progress.finish();
    Ok(AssemblyReport {
        build_id: workspace.id().to_string(),
        output: output.to_path_buf(),
        tag: request.tag.clone(),
        manifest_digest: exported.manifest_digest,
        config_digest: exported.config_digest,
        base: base_image.source.to_string(),
        entry: entry.settings.cmd,
        env_files: env.files,
        base_layers: exported.base_layers,
        new_layers: exported.new_layers.len(),
        install: installed.report,
        timings,
    })
}

/// Forward-only state tracking with per-step timing.
struct Progress<'a> {
    state: &'a mut AssemblyState,
    started: Instant,
    step_started: Instant,
    timings: Vec<StepTiming>,
}

impl<'a> Progress<'a> {
    fn new(state: &'a mut AssemblyState) -> Self {
        let now = Instant::now();
        Self {
            state,
            started: now,
            step_started: now,
            timings: Vec::with_capacity(7),
        }
    }

    fn complete(&mut self, to: AssemblyState) {
        debug_assert_eq!(self.state.next(), Some(to), "assembly steps out of order");

        let elapsed = self.step_started.elapsed();
        *self.state = to;
        self.step_started = Instant::now();
        self.timings.push(StepTiming { state: to, elapsed });

        tracing::info!(
            state = %to,
            elapsed_ms = elapsed.as_millis() as u64,
            "Assembly step completed"
        );
    }

    fn finish(self) -> Vec<StepTiming> {
        tracing::info!(
            total_ms = self.started.elapsed().as_millis() as u64,
            "Image assembly finished"
        );
        self.timings
    }
}
