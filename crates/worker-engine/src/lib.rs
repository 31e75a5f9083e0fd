// worker-engine: Step execution engine for the CDS worker.
//
// Architecture:
//   JobRunner::run → StepExecutor::run_step → dispatch
//     → builtin::run_builtin (in-process)
//     → PluginRunner::run (spawned plugin over the wire protocol)
//   Both paths write through the per-step LogFunnel.

pub mod builtin;
pub mod job_runner;
pub mod log_funnel;
pub mod model;
pub mod parameters;
pub mod plugin_client;
pub mod plugin_runner;
pub mod step_executor;

pub use builtin::{BuiltinAction, BuiltinContext, BuiltinFactory, BuiltinRegistry};
pub use job_runner::{JobReport, JobRunner};
pub use log_funnel::{CollectingLogSink, LogFunnel, LogLine, LogSink, StepLogger};
pub use model::{Action, CurrentJob, JobSpec, Parameter, StepInvocation};
pub use parameters::merge_parameters;
pub use plugin_client::{PluginClient, PluginClientConfig, PluginError};
pub use plugin_runner::PluginRunner;
pub use step_executor::{Dispatch, StepExecutor};
