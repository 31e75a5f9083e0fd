// `git-clone` builtin.

use async_trait::async_trait;
use std::sync::Arc;

use worker_common::{StepResult, WorkerSettings};
use worker_sdk::trace::TracingTraceWriter;
use worker_sdk::{ProcessInvoker, ProcessRequest};

use super::{run_logged, BuiltinAction, BuiltinContext};

pub fn factory(_settings: &WorkerSettings) -> Box<dyn BuiltinAction> {
    Box::new(GitCloneAction {
        invoker: ProcessInvoker::new(Arc::new(TracingTraceWriter::new("git-clone"))),
        program: "git".to_string(),
    })
}

pub struct GitCloneAction {
    invoker: ProcessInvoker,
    program: String,
}

/// Build `git clone` arguments from the step parameters.
pub fn clone_args(ctx: &BuiltinContext<'_>) -> Result<Vec<String>, String> {
    let url = ctx
        .non_empty_param("url")
        .ok_or_else(|| "git-clone requires a 'url' parameter".to_string())?;

    let mut args = vec!["clone".to_string()];
    if let Some(branch) = ctx.non_empty_param("branch") {
        args.extend(["--branch".to_string(), branch.to_string()]);
    }
    if let Some(depth) = ctx.non_empty_param("depth") {
        let depth: u32 = depth
            .parse()
            .map_err(|_| format!("git-clone depth must be a positive number, got {depth:?}"))?;
        if depth > 0 {
            args.extend(["--depth".to_string(), depth.to_string()]);
        }
    }
    args.push("--".to_string());
    args.push(url.to_string());
    if let Some(dir) = ctx.non_empty_param("directory") {
        args.push(dir.to_string());
    }
    Ok(args)
}

#[async_trait]
impl BuiltinAction for GitCloneAction {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult {
        let args = match clone_args(ctx) {
            Ok(args) => args,
            Err(reason) => {
                ctx.log.log(&reason);
                return StepResult::fail(reason);
            }
        };

        let mut request = ProcessRequest::new(self.program.clone())
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = ctx.non_empty_param("working-directory") {
            request = request.current_dir(dir);
        }
        run_logged(&self.invoker, &request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::test_support::Harness;

    #[tokio::test]
    async fn args_with_every_option() {
        let h = Harness::new(
            "git-clone",
            &[
                ("url", "https://example.com/repo.git"),
                ("branch", "develop"),
                ("depth", "1"),
                ("directory", "src"),
            ],
        );
        assert_eq!(
            clone_args(&h.ctx()).unwrap(),
            vec!["clone", "--branch", "develop", "--depth", "1", "--", "https://example.com/repo.git", "src"]
        );
    }

    #[tokio::test]
    async fn url_is_required_and_depth_validated() {
        let h = Harness::new("git-clone", &[]);
        assert!(clone_args(&h.ctx()).unwrap_err().contains("'url'"));

        let h = Harness::new("git-clone", &[("url", "u"), ("depth", "shallow")]);
        assert!(clone_args(&h.ctx()).unwrap_err().contains("depth"));

        let h = Harness::new("git-clone", &[("url", "u"), ("depth", "0")]);
        assert_eq!(clone_args(&h.ctx()).unwrap(), vec!["clone", "--", "u"]);
    }

    #[tokio::test]
    async fn runs_the_configured_program() {
        // `echo` stands in for git so the arguments show up in the log.
        let action = GitCloneAction {
            invoker: ProcessInvoker::new(Arc::new(worker_sdk::trace::NullTraceWriter)),
            program: "echo".to_string(),
        };
        let mut h = Harness::new("git-clone", &[("url", "https://example.com/r.git")]);
        assert!(action.run(&h.ctx()).await.is_success());
        assert_eq!(h.logs().await, vec!["clone -- https://example.com/r.git\n"]);
    }

    #[tokio::test]
    async fn failing_program_fails_the_step() {
        let action = GitCloneAction {
            invoker: ProcessInvoker::new(Arc::new(worker_sdk::trace::NullTraceWriter)),
            program: "false".to_string(),
        };
        let h = Harness::new("git-clone", &[("url", "u")]);
        let result = action.run(&h.ctx()).await;
        assert!(result.reason.contains("exited with code 1"));
    }
}
