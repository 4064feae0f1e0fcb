//! Constants for the BoxForge runtime.

pub mod envs {
    /// Overrides the home directory (`~/.boxforge`).
    pub const BOXFORGE_HOME: &str = "BOXFORGE_HOME";
}

pub mod filenames {
    /// Exclusive lock held while a `Forge` uses a home directory
    pub const LOCK: &str = ".lock";

    /// Prefix of the daily-rolled log file under `logs/`
    pub const LOG_FILE: &str = "boxforge.log";
}

/// Logging defaults
pub mod logging {
    pub const DEFAULT_LEVEL: &str = "info";

    pub const DEBUG_LEVEL: &str = "debug";
}
