// worker-sdk: Foundation layer for the CDS worker.
// This crate has no dependencies on other worker crates. It provides the
// trace abstraction, the async process invoker used by builtin actions, and
// both sides of the plugin wire protocol.

pub mod plugin;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use plugin::{ActionPlugin, Frame, JobDescriptor, PluginJob, PluginOutcome, PluginStatus};
pub use process_invoker::{OutputLine, OutputStream, ProcessCancelledError, ProcessInvoker, ProcessRequest};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
