// Runs the steps of one job in order through the step executor.

use tokio_util::sync::CancellationToken;

use worker_common::StepResult;

use crate::model::JobSpec;
use crate::step_executor::StepExecutor;

/// Outcome of every step that was attempted.
#[derive(Debug, Default)]
pub struct JobReport {
    pub steps: Vec<(String, StepResult)>,
    /// Steps never attempted because an earlier one failed.
    pub skipped: usize,
}

impl JobReport {
    /// The first failure, or success when every attempted step succeeded.
    pub fn result(&self) -> StepResult {
        self.steps
            .iter()
            .map(|(_, result)| result)
            .find(|result| !result.is_success())
            .cloned()
            .unwrap_or_else(StepResult::success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.result().is_success() {
            0
        } else {
            1
        }
    }
}

pub struct JobRunner {
    executor: StepExecutor,
}

impl JobRunner {
    pub fn new(executor: StepExecutor) -> Self {
        Self { executor }
    }

    /// Execute the steps in order, stopping at the first failure.
    pub async fn run(&self, spec: &JobSpec, cancel: &CancellationToken) -> JobReport {
        let steps = spec.invocations();
        tracing::info!(
            build_id = spec.job.build_id,
            run_id = spec.job.run_id,
            "Starting job with {} step(s)",
            steps.len()
        );

        let mut report = JobReport::default();
        for (index, step) in steps.iter().enumerate() {
            let result = self.executor.run_step(&spec.job, step, cancel).await;
            let failed = !result.is_success();
            report.steps.push((step.action.name.clone(), result));
            if failed {
                report.skipped = steps.len() - index - 1;
                break;
            }
        }

        tracing::info!(build_id = spec.job.build_id, "Job finished: {}", report.result());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::default_registry;
    use crate::log_funnel::CollectingLogSink;
    use std::sync::Arc;
    use worker_common::WorkerSettings;

    fn runner(sink: Arc<CollectingLogSink>) -> JobRunner {
        let settings = WorkerSettings::default().with_plugin_dir(std::env::temp_dir().join("cds-no-plugins"));
        JobRunner::new(StepExecutor::new(Arc::new(settings), Arc::new(default_registry()), sink))
    }

    fn spec(json: &str) -> JobSpec {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let sink = Arc::new(CollectingLogSink::new());
        let job = spec(
            r#"{"build_id": 4, "run_id": 1, "steps": [
                {"action": {"name": "script", "parameters": [{"name": "script", "value": "echo one"}]}},
                {"action": {"name": "missing-tool"}},
                {"action": {"name": "script", "parameters": [{"name": "script", "value": "echo three"}]}}
            ]}"#,
        );

        let report = runner(sink.clone()).run(&job, &CancellationToken::new()).await;
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.result().reason, "Unknown builtin step: missing-tool");
        assert_eq!(report.exit_code(), 1);
        assert_eq!(sink.values(4, 0), vec!["one\n"]);
        assert!(sink.values(4, 2).is_empty());
    }

    #[tokio::test]
    async fn empty_job_succeeds() {
        let sink = Arc::new(CollectingLogSink::new());
        let report = runner(sink).run(&spec(r#"{"build_id": 1, "run_id": 1}"#), &CancellationToken::new()).await;
        assert!(report.result().is_success());
        assert_eq!(report.exit_code(), 0);
    }
}
