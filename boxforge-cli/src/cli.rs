use crate::commands::{
    build::BuildArgs, inspect::InspectArgs, pull::PullArgs, unpack::UnpackArgs,
    validate::ValidateArgs,
};
use anyhow::Context;
use boxforge::runtime::constants::{envs, logging};
use boxforge::runtime::layout::FilesystemLayout;
use boxforge::{Forge, ForgeOptions};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// BoxForge - reproducible OCI images for Python applications
#[derive(Parser, Debug)]
#[command(name = "boxforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Assemble an image from a build file
    Build(BuildArgs),
    /// Check a build file offline and print what a build would do
    Validate(ValidateArgs),
    /// Fetch a pinned base image into the local cache
    Pull(PullArgs),
    /// Show the manifest and runtime config of a built image
    Inspect(InspectArgs),
    /// Flatten a built image into a directory
    Unpack(UnpackArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// BoxForge home directory (image cache, build workspaces, logs)
    #[arg(long, global = true, env = envs::BOXFORGE_HOME)]
    pub home: Option<PathBuf>,

    /// Registry to search for unqualified base references (repeatable)
    #[arg(long = "registry", global = true)]
    pub registries: Vec<String>,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalFlags {
    pub fn options(&self) -> anyhow::Result<ForgeOptions> {
        let mut options = match &self.home {
            Some(home) => {
                let home = std::path::absolute(home)
                    .with_context(|| format!("Invalid home directory {}", home.display()))?;
                ForgeOptions::with_home(home)
            }
            None => ForgeOptions::default(),
        };
        options.image_registries = self.registries.clone();
        Ok(options)
    }

    pub fn create_forge(&self) -> anyhow::Result<Forge> {
        let options = self.options()?;
        let home = options.home_dir.clone();
        Forge::new(options)
            .with_context(|| format!("Failed to open BoxForge home {}", home.display()))
    }

    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(FilesystemLayout::new(self.options()?.home_dir).logs_dir())
    }

    pub fn log_level(&self) -> &'static str {
        if self.debug {
            logging::DEBUG_LEVEL
        } else {
            logging::DEFAULT_LEVEL
        }
    }
}
