// Per-step log funnel.
//
// Builtin actions and plugins both log through a `StepLogger`. Lines are
// queued on an unbounded channel and delivered to the external `LogSink` by a
// single drain task, which keeps them in emission order. Closing the funnel
// sends one empty `final_chunk` line and waits for everything queued before it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use worker_common::WorkerSettings;
use worker_sdk::StringUtil;

/// One line delivered to the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub build_id: i64,
    pub step_order: i32,
    pub value: String,
    /// Set on the last chunk of a step.
    pub final_chunk: bool,
}

/// External consumer of step logs (persistence, streaming).
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn send(&self, line: LogLine) -> Result<()>;
}

enum FunnelMessage {
    Line(String),
    Close,
}

/// Cheap, cloneable handle used to log from a step.
///
/// Logging is fire-and-forget: `log` never blocks and never fails. Lines
/// logged after the funnel is closed are discarded.
#[derive(Clone)]
pub struct StepLogger {
    build_id: i64,
    step_order: i32,
    tx: mpsc::UnboundedSender<FunnelMessage>,
}

impl StepLogger {
    /// Queue `line`, appending a newline when it has none.
    pub fn log(&self, line: impl Into<String>) {
        let line = StringUtil::ensure_trailing_newline(line);
        if self.tx.send(FunnelMessage::Line(line)).is_err() {
            tracing::debug!(
                build_id = self.build_id,
                step_order = self.step_order,
                "step log already closed, line discarded"
            );
        }
    }

    pub fn build_id(&self) -> i64 {
        self.build_id
    }

    pub fn step_order(&self) -> i32 {
        self.step_order
    }
}

/// Owner of a step's log stream.
pub struct LogFunnel {
    logger: StepLogger,
    drain: Option<JoinHandle<usize>>,
}

impl LogFunnel {
    /// Open the funnel for one step and start its drain task.
    pub fn open(sink: Arc<dyn LogSink>, build_id: i64, step_order: i32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain(sink, build_id, step_order, rx));
        Self {
            logger: StepLogger {
                build_id,
                step_order,
                tx,
            },
            drain: Some(drain),
        }
    }

    pub fn logger(&self) -> StepLogger {
        self.logger.clone()
    }

    /// Drain every queued line, emit the final chunk and stop the drain task.
    ///
    /// Returns the number of caller lines delivered. Only the first call does
    /// any work; later calls return 0.
    pub async fn close(&mut self) -> usize {
        let Some(drain) = self.drain.take() else {
            return 0;
        };
        let _ = self.logger.tx.send(FunnelMessage::Close);
        match drain.await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!("step log drain task failed: {e}");
                0
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.drain.is_none()
    }
}

impl Drop for LogFunnel {
    fn drop(&mut self) {
        // Not closed explicitly (the step future was dropped): let the detached
        // drain task finish on its own.
        if self.drain.is_some() {
            let _ = self.logger.tx.send(FunnelMessage::Close);
        }
    }
}

async fn drain(
    sink: Arc<dyn LogSink>,
    build_id: i64,
    step_order: i32,
    mut rx: mpsc::UnboundedReceiver<FunnelMessage>,
) -> usize {
    let mut delivered = 0;
    while let Some(FunnelMessage::Line(value)) = rx.recv().await {
        let line = LogLine {
            build_id,
            step_order,
            value,
            final_chunk: false,
        };
        if let Err(e) = sink.send(line).await {
            tracing::warn!(build_id, step_order, "failed to deliver log line: {e:#}");
        }
        delivered += 1;
    }
    rx.close();

    let last = LogLine {
        build_id,
        step_order,
        value: String::new(),
        final_chunk: true,
    };
    if let Err(e) = sink.send(last).await {
        tracing::warn!(build_id, step_order, "failed to deliver final log chunk: {e:#}");
    }
    delivered
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Writes step logs to the worker's stdout.
#[derive(Debug, Default)]
pub struct StdoutLogSink;

#[async_trait]
impl LogSink for StdoutLogSink {
    async fn send(&self, line: LogLine) -> Result<()> {
        if !line.final_chunk {
            print!("[{}:{}] {}", line.build_id, line.step_order, line.value);
        }
        Ok(())
    }
}

/// Keeps every delivered line in memory.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    lines: Mutex<Vec<LogLine>>,
}

impl CollectingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Values of the non-final lines logged for one step, in order.
    pub fn values(&self, build_id: i64, step_order: i32) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.build_id == build_id && l.step_order == step_order && !l.final_chunk)
            .map(|l| l.value.clone())
            .collect()
    }

    /// Number of final chunks seen for one step.
    pub fn final_chunks(&self, build_id: i64, step_order: i32) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.build_id == build_id && l.step_order == step_order && l.final_chunk)
            .count()
    }
}

#[async_trait]
impl LogSink for CollectingLogSink {
    async fn send(&self, line: LogLine) -> Result<()> {
        self.lines.lock().push(line);
        Ok(())
    }
}

#[derive(Serialize)]
struct ApiLogPayload<'a> {
    step_order: i32,
    value: &'a str,
    #[serde(rename = "final")]
    final_chunk: bool,
    timestamp: chrono::DateTime<Utc>,
}

/// Posts each line to the worker API: `POST {api}/queue/{build_id}/log`.
pub struct ApiLogSink {
    client: reqwest::Client,
    api_endpoint: String,
}

impl ApiLogSink {
    pub fn new(settings: &WorkerSettings) -> Result<Self> {
        anyhow::ensure!(
            !settings.api_endpoint.is_empty(),
            "an API endpoint is required to stream logs"
        );
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.tls_skip_verify)
            .build()
            .context("Failed to build log HTTP client")?;
        Ok(Self {
            client,
            api_endpoint: settings.api_endpoint.clone(),
        })
    }
}

#[async_trait]
impl LogSink for ApiLogSink {
    async fn send(&self, line: LogLine) -> Result<()> {
        let url = format!("{}/queue/{}/log", self.api_endpoint, line.build_id);
        let payload = ApiLogPayload {
            step_order: line.step_order,
            value: &line.value,
            final_chunk: line.final_chunk,
            timestamp: Utc::now(),
        };
        self.client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()?;
        Ok(())
    }
}
