// Builtin actions and the process-wide dispatch table.
//
// A `BuiltinFactory` builds a handler closed over the worker settings. The
// registry is assembled once through `BuiltinRegistryBuilder`, installed behind
// a `OnceCell` and only read afterwards.

pub mod artifact;
pub mod git_clone;
pub mod junit;
pub mod script;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use worker_common::constants::{actions, BUILTIN_STOP_GRACE, CANCELED_REASON};
use worker_common::{StepResult, WorkerSettings};
use worker_sdk::{OutputLine, ProcessCancelledError, ProcessInvoker, ProcessRequest};

use crate::log_funnel::StepLogger;
use crate::model::Action;

/// Inputs handed to a builtin handler.
pub struct BuiltinContext<'a> {
    pub action: &'a Action,
    pub build_id: i64,
    pub parameters: &'a BTreeMap<String, String>,
    pub log: &'a StepLogger,
    pub cancel: &'a CancellationToken,
}

impl BuiltinContext<'_> {
    /// Merged parameter value, if present.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Merged parameter value with surrounding whitespace removed; empty
    /// values count as missing.
    pub fn non_empty_param(&self, name: &str) -> Option<&str> {
        self.param(name).map(str::trim).filter(|v| !v.is_empty())
    }
}

/// A step implemented inside the worker process.
#[async_trait]
pub trait BuiltinAction: Send + Sync {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult;
}

/// Builds a handler bound to the worker's settings.
pub type BuiltinFactory = fn(&WorkerSettings) -> Box<dyn BuiltinAction>;

/// Immutable mapping from action name to handler factory.
#[derive(Default)]
pub struct BuiltinRegistry {
    factories: HashMap<&'static str, BuiltinFactory>,
}

impl BuiltinRegistry {
    pub fn builder() -> BuiltinRegistryBuilder {
        BuiltinRegistryBuilder::default()
    }

    pub fn lookup(&self, name: &str) -> Option<BuiltinFactory> {
        self.factories.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[derive(Default)]
pub struct BuiltinRegistryBuilder {
    factories: HashMap<&'static str, BuiltinFactory>,
}

impl BuiltinRegistryBuilder {
    /// Add a handler factory.
    ///
    /// # Panics
    ///
    /// When `name` is already registered.
    pub fn register(mut self, name: &'static str, factory: BuiltinFactory) -> Self {
        if self.factories.insert(name, factory).is_some() {
            panic!("builtin action {name:?} registered twice");
        }
        self
    }

    pub fn build(self) -> BuiltinRegistry {
        BuiltinRegistry {
            factories: self.factories,
        }
    }
}

/// Every builtin shipped with the worker.
pub fn default_registry() -> BuiltinRegistry {
    BuiltinRegistry::builder()
        .register(actions::SCRIPT, script::factory)
        .register(actions::ARTIFACT_UPLOAD, artifact::upload_factory)
        .register(actions::ARTIFACT_DOWNLOAD, artifact::download_factory)
        .register(actions::JUNIT, junit::factory)
        .register(actions::GIT_CLONE, git_clone::factory)
        .build()
}

static GLOBAL_REGISTRY: OnceCell<Arc<BuiltinRegistry>> = OnceCell::new();

/// Publish the process-wide registry. Must run before the first step.
///
/// Only the first call installs anything; later calls get the registry that
/// is already in place.
pub fn install(registry: BuiltinRegistry) -> Arc<BuiltinRegistry> {
    let mut fresh = Some(registry);
    let installed = GLOBAL_REGISTRY.get_or_init(|| Arc::new(fresh.take().unwrap_or_default()));
    if fresh.is_some() {
        tracing::debug!("builtin registry already installed, keeping the first one");
    }
    installed.clone()
}

/// The installed registry, if `install` has run.
pub fn global() -> Option<Arc<BuiltinRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}

/// Run a builtin handler on the caller's task, raced against cancellation.
///
/// Once cancellation fires the handler gets [`BUILTIN_STOP_GRACE`] to stop
/// what it started (its own child processes) before it is dropped; the step
/// result is `execution canceled` either way.
pub async fn run_builtin(handler: &dyn BuiltinAction, ctx: &BuiltinContext<'_>) -> StepResult {
    let run = handler.run(ctx);
    tokio::pin!(run);
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {}
        result = &mut run => return result,
    }
    if tokio::time::timeout(BUILTIN_STOP_GRACE, &mut run).await.is_err() {
        tracing::warn!(action = %ctx.action.name, "builtin did not stop within {BUILTIN_STOP_GRACE:?}");
    }
    ctx.log.log(CANCELED_REASON);
    StepResult::canceled()
}

/// Run a process through the invoker, sending each output line to the step
/// log as it arrives, and fold the outcome into a step result.
pub(crate) async fn run_logged(
    invoker: &ProcessInvoker,
    request: &ProcessRequest,
    ctx: &BuiltinContext<'_>,
) -> StepResult {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<OutputLine>();
    let forward = async {
        while let Some(line) = rx.recv().await {
            ctx.log.log(line.text);
        }
    };
    let (outcome, ()) = tokio::join!(invoker.execute(request, tx, ctx.cancel.clone()), forward);

    match outcome {
        Ok(0) => StepResult::success(),
        Ok(code) => {
            let reason = format!("{} exited with code {code}", request.program);
            ctx.log.log(&reason);
            StepResult::fail(reason)
        }
        Err(e) if e.downcast_ref::<ProcessCancelledError>().is_some() => StepResult::canceled(),
        Err(e) => {
            let reason = format!("{e:#}");
            ctx.log.log(&reason);
            StepResult::fail(reason)
        }
    }
}
