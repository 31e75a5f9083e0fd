// Well-known names shared by the worker crates.

use std::time::Duration;

/// Prefix under which job build variables are exposed to steps
/// (`FOO` becomes `build.FOO`).
pub const BUILD_VARIABLE_PREFIX: &str = "build.";

/// Fixed reason carried by every step stopped through cancellation.
pub const CANCELED_REASON: &str = "execution canceled";

/// Reason prefix for an action that is neither a builtin nor a staged plugin.
pub const UNKNOWN_STEP_REASON: &str = "Unknown builtin step";

/// Upper bound on the plugin `hello`/`ready` exchange.
pub const PLUGIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a canceled builtin may take to stop its own processes.
pub const BUILTIN_STOP_GRACE: Duration = Duration::from_secs(3);

/// Default wait for a killed plugin process to be reaped.
pub const DEFAULT_PLUGIN_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Builtin action names
// ---------------------------------------------------------------------------

pub mod actions {
    pub const SCRIPT: &str = "script";
    pub const ARTIFACT_UPLOAD: &str = "artifact-upload";
    pub const ARTIFACT_DOWNLOAD: &str = "artifact-download";
    pub const JUNIT: &str = "junit";
    pub const GIT_CLONE: &str = "git-clone";
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub mod variables {
    /// Any non-empty value disables TLS certificate verification on plugin
    /// callback channels.
    pub const SKIP_VERIFY: &str = "CDS_SKIP_VERIFY";
    pub const API: &str = "CDS_API";
    pub const WORKER_NAME: &str = "CDS_NAME";
    pub const WORKER_ID: &str = "CDS_WORKER_ID";
    pub const PLUGIN_DIR: &str = "CDS_PLUGIN_DIR";
    pub const ARTIFACT_DIR: &str = "CDS_ARTIFACT_DIR";
    pub const PLUGIN_GRACE_PERIOD_MS: &str = "CDS_PLUGIN_GRACE_PERIOD_MS";
    pub const LOG_JSON: &str = "CDS_LOG_JSON";
}
