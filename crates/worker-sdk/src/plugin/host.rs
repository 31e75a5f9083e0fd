// Plugin side of the protocol: the trait a plugin implements and the loop
// that serves it over stdin/stdout.

use async_trait::async_trait;
use std::process::ExitCode;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use super::protocol::{
    Frame, FrameReader, FrameWriter, Hello, JobDescriptor, LogFrame, Manifest, ParameterSpec,
    PluginOutcome, ProtocolError,
};

/// An out-of-process step implementation.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    /// Plugin name; also the action name it is provisioned under.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn author(&self) -> &str {
        ""
    }

    /// Declared parameters. Defaults fill in arguments the worker did not send.
    fn parameters(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    /// Execute one step.
    async fn run(&self, job: &PluginJob) -> PluginOutcome;

    fn manifest(&self) -> Manifest {
        Manifest {
            name: self.name().to_string(),
            description: self.description().to_string(),
            author: self.author().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// What a plugin sees of the step it is running.
pub struct PluginJob {
    descriptor: JobDescriptor,
    hello: Hello,
    log_tx: mpsc::UnboundedSender<String>,
}

impl PluginJob {
    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// Argument value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.descriptor.args.get(name).map(String::as_str)
    }

    pub fn worker_id(&self) -> &str {
        &self.hello.worker_id
    }

    pub fn callback_endpoint(&self) -> &str {
        &self.hello.callback_endpoint
    }

    /// Stream one line to the step log on the worker.
    pub fn send_log(&self, line: impl Into<String>) {
        // The receiver lives as long as the serve loop; a failed send means
        // the worker is gone and there is nobody left to read the line.
        let _ = self.log_tx.send(line.into());
    }

    /// HTTP client for calling back into the worker endpoint, honouring the
    /// TLS verification setting the worker sent at handshake.
    pub fn callback_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(self.hello.tls_skip_verify)
            .build()
    }
}

/// Serve `plugin` over an arbitrary reader/writer pair until the worker sends
/// `shutdown` or closes the channel.
pub async fn serve<P, R, W>(plugin: &P, reader: R, writer: W) -> Result<(), ProtocolError>
where
    P: ActionPlugin + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    let hello = match reader.read_frame().await? {
        Some(Frame::Hello(hello)) => hello,
        Some(other) => {
            tracing::warn!("expected hello frame, got {}", other.kind());
            return Ok(());
        }
        None => return Ok(()),
    };
    let manifest = plugin.manifest();
    writer.write_frame(&Frame::Ready(manifest.clone())).await?;

    while let Some(frame) = reader.read_frame().await? {
        match frame {
            Frame::Run(mut descriptor) => {
                for spec in &manifest.parameters {
                    descriptor
                        .args
                        .entry(spec.name.clone())
                        .or_insert_with(|| spec.default.clone());
                }
                let outcome = run_job(plugin, descriptor, &hello, &mut writer).await?;
                writer.write_frame(&Frame::Result(outcome)).await?;
            }
            Frame::Shutdown => break,
            other => tracing::warn!("ignoring unexpected {} frame", other.kind()),
        }
    }
    Ok(())
}

async fn run_job<P, W>(
    plugin: &P,
    descriptor: JobDescriptor,
    hello: &Hello,
    writer: &mut FrameWriter<W>,
) -> Result<PluginOutcome, ProtocolError>
where
    P: ActionPlugin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let job = PluginJob {
        descriptor,
        hello: hello.clone(),
        log_tx,
    };

    let run = plugin.run(&job);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(value) = log_rx.recv() => {
                writer.write_frame(&Frame::Log(LogFrame { value })).await?;
            }
        }
    };
    while let Ok(value) = log_rx.try_recv() {
        writer.write_frame(&Frame::Log(LogFrame { value })).await?;
    }
    Ok(outcome)
}

/// Entry point for a plugin binary: serve over the process stdin/stdout.
pub fn main<P: ActionPlugin>(plugin: P) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        serve(&plugin, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", plugin.name());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::protocol::{ParameterKind, PluginStatus};
    use tokio::io::{duplex, split};

    struct GreeterPlugin;

    #[async_trait]
    impl ActionPlugin for GreeterPlugin {
        fn name(&self) -> &str {
            "plugin-greeter"
        }

        fn parameters(&self) -> Vec<ParameterSpec> {
            vec![ParameterSpec {
                name: "who".into(),
                kind: ParameterKind::String,
                description: "Who to greet".into(),
                default: "world".into(),
            }]
        }

        async fn run(&self, job: &PluginJob) -> PluginOutcome {
            let who = job.get("who").unwrap_or_default().to_string();
            if who == "nobody" {
                return PluginOutcome::fail("nobody to greet");
            }
            job.send_log(format!("hello {who}"));
            PluginOutcome::success()
        }
    }

    fn hello() -> Frame {
        Frame::Hello(Hello {
            plugin_name: "plugin-greeter".into(),
            worker_id: "worker-1".into(),
            callback_endpoint: "http://localhost:8081".into(),
            tls_skip_verify: false,
        })
    }

    #[tokio::test]
    async fn serve_handshake_run_and_shutdown() {
        let (worker_end, plugin_end) = duplex(4096);
        let (plugin_read, plugin_write) = split(plugin_end);
        let server = tokio::spawn(async move {
            serve(&GreeterPlugin, BufReader::new(plugin_read), plugin_write).await
        });

        let (worker_read, worker_write) = split(worker_end);
        let mut reader = FrameReader::new(BufReader::new(worker_read));
        let mut writer = FrameWriter::new(worker_write);

        writer.write_frame(&hello()).await.unwrap();
        match reader.read_frame().await.unwrap() {
            Some(Frame::Ready(manifest)) => {
                assert_eq!(manifest.name, "plugin-greeter");
                assert_eq!(manifest.parameters.len(), 1);
            }
            other => panic!("expected ready, got {other:?}"),
        }

        writer
            .write_frame(&Frame::Run(JobDescriptor {
                run_id: 1,
                build_id: 2,
                step_order: 0,
                ..JobDescriptor::default()
            }))
            .await
            .unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Log(LogFrame {
                value: "hello world".into()
            }))
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Result(PluginOutcome::success()))
        );

        writer.write_frame(&Frame::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serve_reports_plugin_failure() {
        let (worker_end, plugin_end) = duplex(4096);
        let (plugin_read, plugin_write) = split(plugin_end);
        let server = tokio::spawn(async move {
            serve(&GreeterPlugin, BufReader::new(plugin_read), plugin_write).await
        });

        let (worker_read, worker_write) = split(worker_end);
        let mut reader = FrameReader::new(BufReader::new(worker_read));
        let mut writer = FrameWriter::new(worker_write);

        writer.write_frame(&hello()).await.unwrap();
        reader.read_frame().await.unwrap();

        let mut job = JobDescriptor::default();
        job.args.insert("who".into(), "nobody".into());
        writer.write_frame(&Frame::Run(job)).await.unwrap();

        match reader.read_frame().await.unwrap() {
            Some(Frame::Result(outcome)) => {
                assert_eq!(outcome.status, PluginStatus::Fail);
                assert_eq!(outcome.message.as_deref(), Some("nobody to greet"));
            }
            other => panic!("expected result, got {other:?}"),
        }

        // Closing the channel ends the loop just like shutdown does.
        drop(reader);
        drop(writer);
        server.await.unwrap().unwrap();
    }

    #[test]
    fn callback_client_builds_with_skip_verify() {
        let (log_tx, _log_rx) = mpsc::unbounded_channel();
        let job = PluginJob {
            descriptor: JobDescriptor::default(),
            hello: Hello {
                plugin_name: "p".into(),
                worker_id: "w".into(),
                callback_endpoint: "https://worker.local".into(),
                tls_skip_verify: true,
            },
            log_tx,
        };
        assert!(job.callback_client().is_ok());
        assert_eq!(job.worker_id(), "w");
        assert_eq!(job.callback_endpoint(), "https://worker.local");
    }
}
