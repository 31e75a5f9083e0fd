/// Diagnostic output abstraction shared by every worker component.
///
/// Step logs (what a job's user reads) never go through this trait; they go
/// through the step log funnel. A `TraceWriter` only carries diagnostics about
/// the worker itself: processes started, signals sent, handshakes made.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("[warning] {message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("[error] {message}"));
    }
}

/// Forwards messages to the `tracing` crate, tagged with the emitting component.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    component: String,
}

impl TracingTraceWriter {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(component = %self.component, "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(component = %self.component, "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(component = %self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(component = %self.component, "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// The level of a collected trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

/// Keeps every message in memory, in emission order. Used by tests.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// True if any message at `level` contains `needle`.
    pub fn contains(&self, level: TraceLevel, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}
