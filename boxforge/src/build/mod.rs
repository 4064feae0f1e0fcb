//! Build description: the build file, its inputs and offline validation.

mod entry;
mod paths;
mod plan;
mod requirements;
mod spec;

pub use entry::EntryCommand;
pub use paths::{BuildContext, image_path_in, normalize_image_path};
pub use plan::{BuildPlan, PlannedBase, PlannedEnvFiles, PlannedManifest, PlannedTree};
pub use requirements::{DependencyManifest, Requirement, canonical_name};
pub use spec::{BaseSpec, BuildSpec, EnvFilesSpec, ManifestSpec, TreeSpec};
