// Step executor: the entry point the job runner calls once per step.
//
//   Dispatching -> Running-Builtin -> Completed
//               -> Running-Plugin  -> Completed
//               -> Completed (unknown step)
//
// Every step gets its own log funnel, closed once whichever path was taken.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use worker_common::{StepResult, WorkerSettings};

use crate::builtin::{run_builtin, BuiltinContext, BuiltinFactory, BuiltinRegistry};
use crate::log_funnel::{LogFunnel, LogSink, StepLogger};
use crate::model::{CurrentJob, StepInvocation};
use crate::parameters::merge_parameters;
use crate::plugin_runner::PluginRunner;

/// How an action name resolved.
pub enum Dispatch {
    Builtin(BuiltinFactory),
    /// A plugin binary is staged at this path.
    Plugin(PathBuf),
    Unknown,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Builtin(_) => write!(f, "Builtin"),
            Dispatch::Plugin(path) => write!(f, "Plugin({})", path.display()),
            Dispatch::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Dispatching,
    RunningBuiltin,
    RunningPlugin,
    Completed,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepPhase::Dispatching => "dispatching",
            StepPhase::RunningBuiltin => "running-builtin",
            StepPhase::RunningPlugin => "running-plugin",
            StepPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

pub struct StepExecutor {
    settings: Arc<WorkerSettings>,
    registry: Arc<BuiltinRegistry>,
    sink: Arc<dyn LogSink>,
    plugins: PluginRunner,
}

impl StepExecutor {
    pub fn new(settings: Arc<WorkerSettings>, registry: Arc<BuiltinRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            plugins: PluginRunner::new(settings.clone()),
            settings,
            registry,
            sink,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Builtins win; otherwise a staged plugin binary; otherwise unknown.
    pub fn resolve(&self, action_name: &str) -> Dispatch {
        if let Some(factory) = self.registry.lookup(action_name) {
            return Dispatch::Builtin(factory);
        }
        match self.settings.plugin_binary_path(action_name) {
            Some(path) if path.is_file() => Dispatch::Plugin(path),
            _ => Dispatch::Unknown,
        }
    }

    /// Execute one step and return its single result.
    pub async fn run_step(&self, job: &CurrentJob, step: &StepInvocation, cancel: &CancellationToken) -> StepResult {
        let span = tracing::info_span!(
            "step",
            build_id = job.build_id,
            step_order = step.step_order,
            action = %step.action.name
        );

        let mut funnel = LogFunnel::open(self.sink.clone(), job.build_id, step.step_order);
        let log = funnel.logger();
        let result = self.dispatch(job, step, &log, cancel).instrument(span).await;
        drop(log);
        let lines = funnel.close().await;

        tracing::info!(
            build_id = job.build_id,
            step_order = step.step_order,
            action = %step.action.name,
            phase = %StepPhase::Completed,
            lines,
            "step finished: {result}"
        );
        result
    }

    async fn dispatch(
        &self,
        job: &CurrentJob,
        step: &StepInvocation,
        log: &StepLogger,
        cancel: &CancellationToken,
    ) -> StepResult {
        let name = step.action.name.as_str();
        tracing::debug!(action = name, phase = %StepPhase::Dispatching);

        match self.resolve(name) {
            Dispatch::Builtin(factory) => {
                tracing::debug!(action = name, phase = %StepPhase::RunningBuiltin);
                let handler = factory(&self.settings);
                let parameters = merge_parameters(&step.action.parameters, &step.parameters, &job.build_variables);
                let ctx = BuiltinContext {
                    action: &step.action,
                    build_id: job.build_id,
                    parameters: &parameters,
                    log,
                    cancel,
                };
                run_builtin(handler.as_ref(), &ctx).await
            }
            Dispatch::Plugin(path) => {
                tracing::debug!(action = name, phase = %StepPhase::RunningPlugin, binary = %path.display());
                self.plugins.run(job, step, log, cancel).await
            }
            Dispatch::Unknown => {
                let result = StepResult::unknown_step(name);
                tracing::warn!(action = name, "{}", result.reason);
                log.log(&result.reason);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::default_registry;
    use crate::log_funnel::CollectingLogSink;
    use crate::model::Action;

    fn executor(plugin_dir: &std::path::Path) -> (StepExecutor, Arc<CollectingLogSink>) {
        let sink = Arc::new(CollectingLogSink::new());
        let settings = WorkerSettings::default().with_plugin_dir(plugin_dir);
        let executor = StepExecutor::new(Arc::new(settings), Arc::new(default_registry()), sink.clone());
        (executor, sink)
    }

    #[test]
    fn resolve_prefers_builtins() {
        let dir = tempfile::tempdir().unwrap();
        // A staged binary named like a builtin never shadows it.
        std::fs::write(dir.path().join("script"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("custom-tool"), "#!/bin/sh\n").unwrap();
        let (executor, _) = executor(dir.path());

        for name in default_registry().names() {
            assert!(matches!(executor.resolve(name), Dispatch::Builtin(_)), "{name}");
        }
        assert!(matches!(executor.resolve("custom-tool"), Dispatch::Plugin(_)));
        assert!(matches!(executor.resolve("nothing-here"), Dispatch::Unknown));
    }

    #[test]
    fn names_outside_the_plugin_dir_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/tool"), "#!/bin/sh\n").unwrap();
        let (executor, _) = executor(&dir.path().join("nested"));

        assert!(matches!(executor.resolve("tool"), Dispatch::Plugin(_)));
        for name in ["/bin/sh", "../nested/tool", "../../../../../../bin/sh", "./tool"] {
            assert!(matches!(executor.resolve(name), Dispatch::Unknown), "{name}");
        }
    }

    #[tokio::test]
    async fn absolute_action_name_fails_as_unknown_step() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path());
        let step = StepInvocation::new(Action::new("/bin/sh"), 0);

        let result = executor.run_step(&CurrentJob::default(), &step, &CancellationToken::new()).await;
        assert_eq!(result, StepResult::fail("Unknown builtin step: /bin/sh"));
    }

    #[tokio::test]
    async fn unknown_step_fails_with_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, sink) = executor(dir.path());
        let job = CurrentJob {
            build_id: 11,
            ..Default::default()
        };
        let step = StepInvocation::new(Action::new("does-not-exist"), 3);

        let result = executor.run_step(&job, &step, &CancellationToken::new()).await;
        assert_eq!(result, StepResult::fail("Unknown builtin step: does-not-exist"));
        assert_eq!(sink.values(11, 3), vec!["Unknown builtin step: does-not-exist\n"]);
        assert_eq!(sink.final_chunks(11, 3), 1);
    }

    #[tokio::test]
    async fn builtin_sees_merged_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, sink) = executor(dir.path());
        let job = CurrentJob {
            build_id: 2,
            run_id: 1,
            build_variables: vec![crate::model::Parameter::new("branch", "main")],
        };
        let action = Action::new("script")
            .with_parameter("script", "echo \"$GREETING $BUILD_BRANCH\"")
            .with_parameter("GREETING", "hello");
        let step = StepInvocation::new(action, 0).with_override("GREETING", "bonjour");

        let result = executor.run_step(&job, &step, &CancellationToken::new()).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(sink.values(2, 0), vec!["bonjour main\n"]);
    }

    #[tokio::test]
    async fn already_canceled_step_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, sink) = executor(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let step = StepInvocation::new(Action::new("script").with_parameter("script", "echo ran"), 0);

        let result = executor.run_step(&CurrentJob::default(), &step, &cancel).await;
        assert!(result.is_canceled());
        assert!(!sink.values(0, 0).contains(&"ran\n".to_string()));
    }
}
