//! BoxForge: deterministic OCI image assembly for Python applications.
//!
//! A build file names a pinned base runtime, a source tree, a configuration
//! tree, environment files, a dependency manifest and one entry command.
//! [`Forge`] turns that into an OCI image layout on disk:
//!
//! ```ignore
//! let forge = Forge::new(ForgeOptions::default())?;
//! let spec = BuildSpec::load(Path::new("boxforge.yaml"))?;
//! let report = forge
//!     .build(AssemblyRequest {
//!         spec,
//!         context: BuildContext::new(".")?,
//!         output: "out/image".into(),
//!         tag: Some("app:1.0".into()),
//!     })
//!     .await?;
//! println!("{}", report.manifest_digest);
//! ```

pub mod assembly;
pub mod build;
pub mod images;
pub mod install;
pub mod rootfs;
pub mod runtime;
pub mod util;

pub use assembly::{Assembly, AssemblyReport, AssemblyRequest, AssemblyState};
pub use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
pub use build::{BuildContext, BuildPlan, BuildSpec};
pub use runtime::Forge;
pub use runtime::options::ForgeOptions;
pub use util::init_logging;
