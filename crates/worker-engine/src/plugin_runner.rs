// Plugin bridge: run one step in a spawned plugin process.
//
// The plugin's `run` goes to its own task; the caller races that task against
// cancellation. The process is killed on every path before `run` returns.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use worker_common::constants::CANCELED_REASON;
use worker_common::{StepResult, WorkerSettings};
use worker_sdk::plugin::{JobDescriptor, PluginOutcome, PluginStatus};

use crate::log_funnel::StepLogger;
use crate::model::{CurrentJob, StepInvocation};
use crate::parameters::merge_parameters;
use crate::plugin_client::{PluginClient, PluginClientConfig};

pub struct PluginRunner {
    settings: Arc<WorkerSettings>,
}

impl PluginRunner {
    pub fn new(settings: Arc<WorkerSettings>) -> Self {
        Self { settings }
    }

    /// Run `step` through the plugin staged under its action name.
    pub async fn run(
        &self,
        job: &CurrentJob,
        step: &StepInvocation,
        log: &StepLogger,
        cancel: &CancellationToken,
    ) -> StepResult {
        let config = PluginClientConfig::from_settings(&self.settings, &step.action.name);
        let mut client = PluginClient::new(config);

        let result = drive(&mut client, job, step, log, cancel).await;
        client.kill().await;
        result
    }
}

async fn drive(
    client: &mut PluginClient,
    job: &CurrentJob,
    step: &StepInvocation,
    log: &StepLogger,
    cancel: &CancellationToken,
) -> StepResult {
    let name = step.action.name.as_str();

    let instance = tokio::select! {
        biased;
        _ = cancel.cancelled() => return canceled(log),
        instance = client.instance() => instance,
    };
    let instance = match instance {
        Ok(instance) => instance,
        Err(e) => {
            let reason = format!("Unable to init plugin {name}: {e}");
            tracing::warn!(plugin = name, "{reason}");
            log.log(&reason);
            return StepResult::fail(reason);
        }
    };

    let descriptor = JobDescriptor {
        run_id: job.run_id,
        build_id: job.build_id,
        step_order: step.step_order,
        args: merge_parameters(&step.action.parameters, &step.parameters, &job.build_variables),
    };
    tracing::debug!(plugin = name, args = descriptor.args.len(), "running plugin");

    let mut task = tokio::spawn(instance.run(descriptor, log.clone()));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            task.abort();
            // Returns once a poll already in flight on another thread is done,
            // so no plugin line can follow the cancellation line.
            let _ = (&mut task).await;
            canceled(log)
        }
        joined = &mut task => match joined {
            Ok(Ok(outcome)) => outcome_to_result(outcome),
            Ok(Err(e)) => {
                let reason = format!("Plugin {name} failed: {e}");
                log.log(&reason);
                StepResult::fail(reason)
            }
            Err(e) => {
                let reason = format!("Plugin {name} task failed: {e}");
                log.log(&reason);
                StepResult::fail(reason)
            }
        },
    }
}

fn canceled(log: &StepLogger) -> StepResult {
    log.log(CANCELED_REASON);
    StepResult::canceled()
}

/// The plugin's own status passes through; its message becomes the reason.
fn outcome_to_result(outcome: PluginOutcome) -> StepResult {
    let reason = outcome.message.unwrap_or_default();
    match outcome.status {
        PluginStatus::Success => StepResult {
            reason,
            ..StepResult::success()
        },
        PluginStatus::Fail => StepResult::fail(reason),
    }
}
