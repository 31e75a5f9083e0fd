// Plugin wire protocol.
//
// A plugin talks to the worker over its own stdin/stdout. Every frame is one
// JSON object on one line: `{"type": "<frame type>", "body": <payload>}`.
//
//   worker                         plugin
//     | -- hello ------------------> |
//     | <------------------ ready -- |
//     | -- run --------------------> |
//     | <-------------------- log -- |  (any number)
//     | <----------------- result -- |
//     | -- shutdown ---------------> |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Frame decoding / transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Sent by the worker right after spawning the plugin.
///
/// Carries what the plugin needs to reach back to the worker on its own:
/// the worker identity and callback endpoint, and whether the callback
/// channel should skip TLS certificate verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub plugin_name: String,
    pub worker_id: String,
    pub callback_endpoint: String,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

/// Kind of a declared plugin parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Text,
    Boolean,
}

/// A parameter a plugin declares, with its default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: String,
}

/// Plugin self-description returned in the `ready` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

/// The job descriptor sent to a plugin: where the step sits in the build and
/// the fully merged argument map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Enclosing run (pipeline build / workflow node run).
    pub run_id: i64,
    /// The job build this step belongs to.
    pub build_id: i64,
    pub step_order: i32,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// One log line streamed back by a plugin during `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    pub value: String,
}

/// Two-valued plugin outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Success,
    Fail,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Success => write!(f, "success"),
            PluginStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Body of the `result` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginOutcome {
    pub status: PluginStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginOutcome {
    pub fn success() -> Self {
        Self {
            status: PluginStatus::Success,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Fail,
            message: Some(message.into()),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    Ready(Manifest),
    Run(JobDescriptor),
    Log(LogFrame),
    Result(PluginOutcome),
    Shutdown,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Ready(_) => "ready",
            Frame::Run(_) => "run",
            Frame::Log(_) => "log",
            Frame::Result(_) => "result",
            Frame::Shutdown => "shutdown",
        }
    }
}

/// Reads newline-delimited frames. Blank lines are skipped.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next frame, or `Ok(None)` once the peer closed its end.
    ///
    /// Invalid UTF-8 is replaced lossily, so such a line surfaces as
    /// [`ProtocolError::Malformed`] like any other non-frame output.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&self.buf);
            let line = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|source| ProtocolError::Malformed {
                    line: line.to_string(),
                    source,
                });
        }
    }
}

/// Writes newline-delimited frames, flushing after each one.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_vec(frame).map_err(ProtocolError::Encode)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
