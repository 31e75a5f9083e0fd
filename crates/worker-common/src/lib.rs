// worker-common: Shared services and infrastructure for the CDS worker.
// Depends on `worker-sdk` only.

pub mod constants;
pub mod logging;
pub mod settings;
pub mod step_result;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use settings::{SettingsError, WorkerSettings};
pub use step_result::{StepResult, StepStatus};
