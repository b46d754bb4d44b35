// Constants shared by the worker: directories, platform detection, limits,
// and the names of variables and environment knobs the worker reads.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known directories used by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Work,
    Actions,
    Temp,
    Tools,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "macOS"),
            OsPlatform::Windows => write!(f, "Windows"),
        }
    }
}

impl OsPlatform {
    /// Container jobs and container actions need a Linux host.
    pub fn supports_containers(&self) -> bool {
        matches!(self, OsPlatform::Linux)
    }
}

/// The current OS platform, detected at compile time.
#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Issues of one type recorded on a timeline record; later ones are only counted.
pub const MAX_ISSUE_COUNT: u32 = 10;

/// Issue messages are truncated to this many characters.
pub const MAX_ISSUE_MESSAGE_LENGTH: usize = 4096;

/// Default issue matcher timeout per line, in seconds.
pub const DEFAULT_ISSUE_MATCHER_TIMEOUT_SECS: u64 = 1;

/// Attempts before a timing-out matcher is removed.
pub const ISSUE_MATCHER_MAX_ATTEMPTS: u32 = 3;

/// Attempts for pulling or building an action image.
pub const CONTAINER_SETUP_MAX_ATTEMPTS: u32 = 3;

/// Maximum nesting depth for composite actions.
pub const COMPOSITE_ACTIONS_MAX_DEPTH: u32 = 9;

/// Default step timeout when a step does not set `timeout-minutes`.
pub const DEFAULT_STEP_TIMEOUT_MINUTES: u32 = 360;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub mod pipeline {
    /// Repository alias for the workflow's own repository.
    pub const SELF_ALIAS: &str = "self";

    /// Registry references in action manifests and steps start with this.
    pub const DOCKER_PREFIX: &str = "docker://";
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

pub mod variables {
    pub mod actions {
        /// Enables `set-env` and `add-path`.
        pub const ALLOW_UNSUPPORTED_COMMANDS: &str = "ACTIONS_ALLOW_UNSECURE_COMMANDS";
        /// Permits stop-commands tokens that are empty or collide with a command.
        pub const ALLOW_UNSECURE_STOP_COMMAND_TOKENS: &str =
            "ACTIONS_ALLOW_UNSECURE_STOPCOMMAND_TOKENS";
        /// Enables `##[debug]` lines in step logs.
        pub const STEP_DEBUG: &str = "ACTIONS_STEP_DEBUG";
        /// Per-line issue matcher timeout, in seconds.
        pub const ISSUE_MATCHER_TIMEOUT: &str = "GITHUB_ACTIONS_RUNNER_ISSUE_MATCHER_TIMEOUT";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_container_support() {
        assert!(OsPlatform::Linux.supports_containers());
        assert!(!OsPlatform::Windows.supports_containers());
        assert_eq!(OsPlatform::MacOS.to_string(), "macOS");
    }
}
