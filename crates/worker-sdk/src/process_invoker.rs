use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a process gets to honour SIGINT before it is killed.
const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_millis(2500);

/// Returned (wrapped in `anyhow::Error`) when the cancellation token fired
/// before the process exited on its own.
#[derive(Debug, thiserror::Error)]
#[error("Process '{program}' was cancelled")]
pub struct ProcessCancelledError {
    pub program: String,
}

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Everything needed to start a process. Arguments are passed verbatim,
/// no shell splitting takes place.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Spawns a child process, streams its stdout/stderr line by line into a
/// channel, and stops it when the cancellation token fires
/// (SIGINT, then SIGKILL after a grace period).
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    interrupt_grace: Duration,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            trace,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }

    /// Override how long SIGINT is given before the process is killed.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    /// Run `request` to completion and return its exit code.
    ///
    /// Output lines are sent to `output` in the order each pipe produced them.
    /// The sender is dropped once both pipes are drained, so a receiver loop
    /// terminates on its own. When `cancel` fires first the process is stopped
    /// and a [`ProcessCancelledError`] is returned.
    pub async fn execute(
        &self,
        request: &ProcessRequest,
        output: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        anyhow::ensure!(!request.program.is_empty(), "program must not be empty");

        self.trace.info(&format!(
            "Starting process '{}' with arguments {:?}",
            request.program, request.args
        ));

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so cancellation reaches everything the process started.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = request.working_directory.as_ref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start process '{}'", request.program))?;
        let pid = child.id().unwrap_or(0);
        self.trace
            .verbose(&format!("Process started with process id {pid}."));

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(forward_lines(pipe, OutputStream::Stdout, output.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(forward_lines(pipe, OutputStream::Stderr, output)));

        let outcome = tokio::select! {
            status = child.wait() => {
                status
                    .map(|s| s.code().unwrap_or(-1))
                    .context("Failed to wait for process")
            }
            _ = cancel.cancelled() => {
                self.trace.info(&format!("Cancellation requested, stopping process {pid}."));
                self.stop(&mut child).await;
                Err(ProcessCancelledError { program: request.program.clone() }.into())
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if outcome.is_ok() {
                let _ = task.await;
            } else {
                task.abort();
            }
        }

        if let Ok(code) = outcome {
            self.trace.info(&format!(
                "Finished process {pid} with exit code {code}, and elapsed time {:.2?}.",
                start.elapsed()
            ));
        }
        outcome
    }

    /// Interrupt, then kill if the process ignores the interrupt.
    async fn stop(&self, child: &mut Child) {
        if signal_group(child, GroupSignal::Interrupt) {
            match tokio::time::timeout(self.interrupt_grace, child.wait()).await {
                Ok(_) => {
                    self.trace.verbose("Process exited after SIGINT.");
                    return;
                }
                Err(_) => self.trace.verbose(&format!(
                    "Process did not honor SIGINT within {:.1}s.",
                    self.interrupt_grace.as_secs_f64()
                )),
            }
        }
        signal_group(child, GroupSignal::Kill);
        if let Err(e) = child.kill().await {
            self.trace.warning(&format!("Failed to kill process: {e}"));
        }
    }
}

async fn forward_lines<R>(pipe: R, stream: OutputStream, output: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(text)) = lines.next_line().await {
        if output.send(OutputLine { stream, text }).is_err() {
            break;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Interrupt,
    Kill,
}

/// Signal the child's whole process group. Returns false when the child is
/// already gone or the signal could not be delivered.
#[cfg(unix)]
fn signal_group(child: &Child, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Interrupt => Signal::SIGINT,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match child.id() {
        Some(pid) => killpg(Pid::from_raw(pid as i32), sig).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: GroupSignal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel};

    fn invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter)).with_interrupt_grace(Duration::from_millis(200))
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn execute_streams_stdout_and_stderr() {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = ProcessRequest::new("sh").args(["-c", "echo out; echo err >&2"]);
        let invoker = invoker();

        let (code, lines) = tokio::join!(
            invoker.execute(&request, tx, CancellationToken::new()),
            collect(rx)
        );

        assert_eq!(code.unwrap(), 0);
        assert!(lines.contains(&OutputLine { stream: OutputStream::Stdout, text: "out".into() }));
        assert!(lines.contains(&OutputLine { stream: OutputStream::Stderr, text: "err".into() }));
    }

    #[tokio::test]
    async fn execute_returns_non_zero_exit_code() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = ProcessRequest::new("sh").args(["-c", "exit 3"]);
        let code = invoker()
            .execute(&request, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn execute_passes_environment() {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = ProcessRequest::new("sh")
            .args(["-c", "echo $MY_TEST_VAR"])
            .env("MY_TEST_VAR", "value_123");
        let invoker = invoker();
        let (code, lines) = tokio::join!(
            invoker.execute(&request, tx, CancellationToken::new()),
            collect(rx)
        );
        assert_eq!(code.unwrap(), 0);
        assert_eq!(lines[0].text, "value_123");
    }

    #[tokio::test]
    async fn execute_nonexistent_program_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = ProcessRequest::new("nonexistent_command_xyz_123");
        let result = invoker()
            .execute(&request, tx, CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let request = ProcessRequest::new("sleep").arg("30");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let trace = Arc::new(CollectingTraceWriter::new());
        let invoker = ProcessInvoker::new(trace.clone()).with_interrupt_grace(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = invoker.execute(&request, tx, cancel).await.unwrap_err();
        assert!(err.downcast_ref::<ProcessCancelledError>().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(trace.contains(TraceLevel::Info, "Cancellation requested"));
    }
}
