// Worker side of the plugin protocol: spawn, handshake, run, kill.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use worker_common::WorkerSettings;
use worker_sdk::plugin::{Frame, FrameReader, FrameWriter, Hello, JobDescriptor, Manifest, PluginOutcome, ProtocolError};

use crate::log_funnel::StepLogger;

/// Failures of the plugin bridge.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin binary {} not found", .path.display())]
    BinaryNotFound { path: PathBuf },

    #[error("failed to start {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no handshake within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("expected a ready frame, got {frame}")]
    UnexpectedFrame { frame: &'static str },

    #[error("plugin closed its channel {stage}")]
    TransportClosed { stage: &'static str },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything needed to spawn and greet one plugin.
#[derive(Debug, Clone)]
pub struct PluginClientConfig {
    pub plugin_name: String,
    pub binary_path: PathBuf,
    pub worker_id: String,
    pub callback_endpoint: String,
    pub tls_skip_verify: bool,
    pub handshake_timeout: Duration,
    pub grace_period: Duration,
}

impl PluginClientConfig {
    pub fn from_settings(settings: &WorkerSettings, plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            // An invalid name gets an empty path and fails as `BinaryNotFound`.
            binary_path: settings.plugin_binary_path(plugin_name).unwrap_or_default(),
            worker_id: settings.worker_id.clone(),
            callback_endpoint: settings.api_endpoint.clone(),
            tls_skip_verify: settings.tls_skip_verify,
            handshake_timeout: settings.plugin_handshake_timeout,
            grace_period: settings.plugin_grace_period,
        }
    }
}

/// Owner of one plugin subprocess.
///
/// The process lives until [`PluginClient::kill`] (or drop, through
/// `kill_on_drop`). `kill` may be called any number of times.
pub struct PluginClient {
    config: PluginClientConfig,
    child: Option<Child>,
    /// Process group the plugin leads; outlives the plugin itself when it
    /// leaves children behind.
    process_group: Option<u32>,
    stderr_task: Option<JoinHandle<()>>,
}

impl PluginClient {
    pub fn new(config: PluginClientConfig) -> Self {
        Self {
            config,
            child: None,
            process_group: None,
            stderr_task: None,
        }
    }

    pub fn config(&self) -> &PluginClientConfig {
        &self.config
    }

    /// Process id of the running plugin, if one was spawned and not yet killed.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawn the plugin and complete the `hello`/`ready` handshake.
    pub async fn instance(&mut self) -> Result<PluginInstance, PluginError> {
        let path = self.config.binary_path.clone();
        if !path.is_file() {
            return Err(PluginError::BinaryNotFound { path });
        }

        let mut cmd = Command::new(&path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| PluginError::Spawn {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(plugin = %self.config.plugin_name, pid = ?child.id(), "plugin spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            let name = self.config.plugin_name.clone();
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %name, "{line}");
                }
            }));
        }
        self.process_group = child.id();
        self.child = Some(child);

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(PluginError::TransportClosed { stage: "at spawn" });
        };
        let mut instance = PluginInstance {
            name: self.config.plugin_name.clone(),
            manifest: Manifest::default(),
            reader: FrameReader::new(BufReader::new(stdout)),
            writer: FrameWriter::new(stdin),
        };

        let hello = Hello {
            plugin_name: self.config.plugin_name.clone(),
            worker_id: self.config.worker_id.clone(),
            callback_endpoint: self.config.callback_endpoint.clone(),
            tls_skip_verify: self.config.tls_skip_verify,
        };
        let timeout = self.config.handshake_timeout;
        let manifest = tokio::time::timeout(timeout, instance.handshake(hello))
            .await
            .map_err(|_| PluginError::HandshakeTimeout { timeout })??;
        instance.manifest = manifest;

        tracing::debug!(
            plugin = %instance.name,
            parameters = instance.manifest.parameters.len(),
            "plugin ready"
        );
        Ok(instance)
    }

    /// Terminate the plugin and everything in its process group, then wait
    /// (bounded) for the plugin to be reaped.
    pub async fn kill(&mut self) {
        if let Some(pgid) = self.process_group.take() {
            kill_group(pgid);
        }
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(plugin = %self.config.plugin_name, %status, "plugin already exited");
                }
                _ => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(plugin = %self.config.plugin_name, "kill: {e}");
                    }
                    match tokio::time::timeout(self.config.grace_period, child.wait()).await {
                        Ok(_) => tracing::debug!(plugin = %self.config.plugin_name, "plugin killed"),
                        Err(_) => tracing::warn!(
                            plugin = %self.config.plugin_name,
                            "plugin not reaped within {:?}",
                            self.config.grace_period
                        ),
                    }
                }
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// SIGKILL the whole group. ESRCH (nobody left in it) is expected.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pgid, "killpg: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// The callable interface of a plugin that completed its handshake.
pub struct PluginInstance {
    name: String,
    manifest: Manifest,
    reader: FrameReader<BufReader<ChildStdout>>,
    writer: FrameWriter<ChildStdin>,
}

impl PluginInstance {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    async fn handshake(&mut self, hello: Hello) -> Result<Manifest, PluginError> {
        self.writer.write_frame(&Frame::Hello(hello)).await?;
        match self.reader.read_frame().await? {
            Some(Frame::Ready(manifest)) => Ok(manifest),
            Some(other) => Err(PluginError::UnexpectedFrame { frame: other.kind() }),
            None => Err(PluginError::TransportClosed {
                stage: "during the handshake",
            }),
        }
    }

    /// Send the job, forward its log frames to `log` and return the outcome.
    ///
    /// Output that is not a valid frame is kept as a raw log line.
    pub async fn run(mut self, descriptor: JobDescriptor, log: StepLogger) -> Result<PluginOutcome, PluginError> {
        self.writer.write_frame(&Frame::Run(descriptor)).await?;
        loop {
            match self.reader.read_frame().await {
                Ok(Some(Frame::Log(frame))) => log.log(frame.value),
                Ok(Some(Frame::Result(outcome))) => {
                    if let Err(e) = self.writer.write_frame(&Frame::Shutdown).await {
                        tracing::debug!(plugin = %self.name, "shutdown not delivered: {e}");
                    }
                    return Ok(outcome);
                }
                Ok(Some(other)) => {
                    tracing::warn!(plugin = %self.name, "ignoring unexpected {} frame", other.kind());
                }
                Ok(None) => {
                    return Err(PluginError::TransportClosed {
                        stage: "before sending a result",
                    })
                }
                Err(ProtocolError::Malformed { line, .. }) => log.log(line),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
