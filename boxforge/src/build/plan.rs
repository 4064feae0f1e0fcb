//! Offline build validation.
//!
//! `BuildPlan::create` checks a build file against its context without the
//! network or the installer, and describes what an assembly would do.

use crate::build::paths::BuildContext;
use crate::build::requirements::{DependencyManifest, Requirement};
use crate::build::spec::{BaseSpec, BuildSpec};
use crate::images::{OciImageLayout, Pin};
use crate::rootfs::FilePattern;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Debug, Serialize)]
pub struct BuildPlan {
    pub context: PathBuf,
    pub base: PlannedBase,
    pub source: PlannedTree,
    pub config: Option<PlannedTree>,
    pub env_files: PlannedEnvFiles,
    pub dependencies: PlannedManifest,
    pub entry: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub source_date_epoch: u64,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedBase {
    Image {
        reference: String,
        /// `digest` or `tag`
        pinned_by: &'static str,
    },
    Layout {
        path: PathBuf,
        manifest_digest: String,
        layers: usize,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct PlannedTree {
    pub path: PathBuf,
    pub dest: String,
    pub files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlannedEnvFiles {
    pub pattern: String,
    pub dest: String,
    pub matches: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlannedManifest {
    pub path: PathBuf,
    pub dest: String,
    pub requirements: Vec<Requirement>,
}

impl BuildPlan {
    /// Validate `spec` against `context`.
    ///
    /// Fails with `Config` on anything that would make an assembly fail
    /// before the base image or installer is reached. Reproducibility risks
    /// that do not fail a build are listed in `warnings`.
    pub fn create(spec: &BuildSpec, context: &BuildContext) -> BoxforgeResult<Self> {
        spec.validate()?;
        let mut warnings = Vec::new();

        let base = match &spec.base {
            BaseSpec::Image(_) => {
                let reference = spec.base_reference()?.ok_or_else(|| {
                    BoxforgeError::Internal("registry base without a reference".into())
                })?;
                PlannedBase::Image {
                    reference: reference.as_str().to_string(),
                    pinned_by: match reference.pin() {
                        Pin::Digest(_) => "digest",
                        Pin::Tag(_) => "tag",
                    },
                }
            }
            BaseSpec::Layout(path) => {
                let dir = context.resolve(path)?;
                let layout = OciImageLayout::open(&dir).map_err(|e| {
                    BoxforgeError::Config(format!(
                        "Base layout {} is not usable: {}",
                        path.display(),
                        e
                    ))
                })?;
                PlannedBase::Layout {
                    path: path.clone(),
                    manifest_digest: layout.manifest_digest().to_string(),
                    layers: layout.manifest().layers().len(),
                }
            }
        };
        if let PlannedBase::Image { pinned_by: "tag", reference } = &base {
            warnings.push(format!(
                "Base image '{}' is pinned by tag only; pin a digest for byte-identical rebuilds",
                reference
            ));
        }

        let source = plan_tree(context, &spec.source.path, spec.source_dest()?, "Source")?;

        let config = match (&spec.config, spec.config_dest()?) {
            (Some(tree), Some(dest)) => Some(plan_tree(context, &tree.path, dest, "Configuration")?),
            _ => None,
        };

        let pattern = FilePattern::new(&spec.env_files.pattern)?;
        let matches = pattern
            .collect(context.root())?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        let env_files = PlannedEnvFiles {
            pattern: spec.env_files.pattern.clone(),
            dest: spec.env_files_dest()?,
            matches,
        };

        let manifest_path = context.resolve(&spec.dependencies.path)?;
        if !manifest_path.is_file() {
            return Err(BoxforgeError::Config(format!(
                "Dependency manifest not found: {}",
                spec.dependencies.path.display()
            )));
        }
        let manifest = DependencyManifest::load(&manifest_path)?;
        for requirement in manifest.unpinned() {
            warnings.push(format!(
                "Requirement '{}' (line {}) is not pinned to an exact version",
                requirement.name, requirement.line
            ));
        }
        for include in manifest.file_includes() {
            warnings.push(format!(
                "Manifest option '{}' refers to a file that is not copied into the image",
                include
            ));
        }

        Ok(Self {
            context: context.root().to_path_buf(),
            base,
            source,
            config,
            env_files,
            dependencies: PlannedManifest {
                path: spec.dependencies.path.clone(),
                dest: spec.manifest_dest()?,
                requirements: manifest.requirements,
            },
            entry: spec.entry_argv(),
            workdir: spec.workdir()?,
            env: spec.env.clone(),
            labels: spec.labels.clone(),
            source_date_epoch: spec.source_date_epoch,
            warnings,
        })
    }
}

fn plan_tree(
    context: &BuildContext,
    path: &Path,
    dest: String,
    what: &str,
) -> BoxforgeResult<PlannedTree> {
    let dir = context.resolve(path)?;
    if !dir.is_dir() {
        return Err(BoxforgeError::Config(format!(
            "{} directory not found: {}",
            what,
            path.display()
        )));
    }
    let files = WalkDir::new(&dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_dir())
        .count();
    Ok(PlannedTree {
        path: path.to_path_buf(),
        dest,
        files,
    })
}

impl fmt::Display for BuildPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Context: {}", self.context.display())?;
        match &self.base {
            PlannedBase::Image {
                reference,
                pinned_by,
            } => writeln!(f, "1. Base:         {} (pinned by {})", reference, pinned_by)?,
            PlannedBase::Layout {
                path,
                manifest_digest,
                layers,
            } => writeln!(
                f,
                "1. Base:         oci:{} ({}, {} layers)",
                path.display(),
                manifest_digest,
                layers
            )?,
        }
        writeln!(
            f,
            "2. Source:       {} -> {} ({} files)",
            self.source.path.display(),
            self.source.dest,
            self.source.files
        )?;
        match &self.config {
            Some(tree) => writeln!(
                f,
                "3. Config:       {} -> {} ({} files)",
                tree.path.display(),
                tree.dest,
                tree.files
            )?,
            None => writeln!(f, "3. Config:       (disabled)")?,
        }
        if self.env_files.matches.is_empty() {
            writeln!(
                f,
                "4. Env files:    {} -> {} (no matches)",
                self.env_files.pattern, self.env_files.dest
            )?;
        } else {
            writeln!(
                f,
                "4. Env files:    {} -> {} ({})",
                self.env_files.pattern,
                self.env_files.dest,
                self.env_files.matches.join(", ")
            )?;
        }
        writeln!(
            f,
            "5. Manifest:     {} -> {} ({} requirements)",
            self.dependencies.path.display(),
            self.dependencies.dest,
            self.dependencies.requirements.len()
        )?;
        writeln!(f, "6. Install:      {} requirements", self.dependencies.requirements.len())?;
        write!(f, "7. Entry:        {}", self.entry.join(" "))?;
        for warning in &self.warnings {
            write!(f, "\nwarning: {}", warning)?;
        }
        Ok(())
    }
}
