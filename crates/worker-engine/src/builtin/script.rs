// `script` builtin: runs the `script` parameter as a shell script.
//
// The body is written to a temp file and run with `sh -e`, or executed
// directly when it starts with a shebang. Merged parameters are exported to
// the script environment (`build.git-branch` becomes `BUILD_GIT_BRANCH`).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use worker_common::{StepResult, WorkerSettings};
use worker_sdk::trace::TracingTraceWriter;
use worker_sdk::{ProcessInvoker, ProcessRequest, StringUtil};

use super::{run_logged, BuiltinAction, BuiltinContext};

pub fn factory(_settings: &WorkerSettings) -> Box<dyn BuiltinAction> {
    Box::new(ScriptAction::new(std::env::temp_dir()))
}

pub struct ScriptAction {
    invoker: ProcessInvoker,
    temp_dir: PathBuf,
}

impl ScriptAction {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            invoker: ProcessInvoker::new(Arc::new(TracingTraceWriter::new("script"))),
            temp_dir: temp_dir.into(),
        }
    }

    fn request(&self, script_file: &Path, body: &str, ctx: &BuiltinContext<'_>) -> ProcessRequest {
        let file = script_file.to_string_lossy().into_owned();
        let mut request = if body.starts_with("#!") {
            ProcessRequest::new(file)
        } else {
            ProcessRequest::new("sh").arg("-e").arg(file)
        };

        for (key, value) in ctx.parameters {
            request = request.env(StringUtil::to_env_name(key), value.clone());
        }
        request = request.env("CDS_BUILD_ID", ctx.build_id.to_string());
        if let Some(dir) = ctx.non_empty_param("working-directory") {
            request = request.current_dir(dir);
        }
        request
    }
}

#[async_trait]
impl BuiltinAction for ScriptAction {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult {
        let body = ctx.param("script").unwrap_or_default();
        if body.trim().is_empty() {
            ctx.log.log("Script body is empty, nothing to run.");
            return StepResult::success();
        }

        let script_file = self
            .temp_dir
            .join(format!("cds_script_{}.sh", uuid::Uuid::new_v4().as_simple()));
        if let Err(e) = write_script(&script_file, body).await {
            let reason = format!("Failed to write script file {}: {e}", script_file.display());
            ctx.log.log(&reason);
            return StepResult::fail(reason);
        }
        tracing::debug!(file = %script_file.display(), "running script");

        let request = self.request(&script_file, body, ctx);
        let result = run_logged(&self.invoker, &request, ctx).await;

        let _ = tokio::fs::remove_file(&script_file).await;
        result
    }
}

async fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}
