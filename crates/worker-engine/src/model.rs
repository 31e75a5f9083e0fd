// Job and step data as the orchestrator hands it to the worker.

use serde::{Deserialize, Serialize};

/// A name/value pair. Used for declared action parameters, invocation-time
/// overrides and job build variables alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An action definition: its name and the parameters it declares, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }
}

/// The job currently assigned to this worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentJob {
    /// Job build identifier; log lines are tagged with it.
    pub build_id: i64,
    /// Enclosing pipeline build / workflow node run.
    pub run_id: i64,
    #[serde(default)]
    pub build_variables: Vec<Parameter>,
}

/// One step to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub action: Action,
    /// Position of the step inside the job.
    #[serde(default)]
    pub step_order: i32,
    /// Invocation-time overrides of the action's declared parameters.
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl StepInvocation {
    pub fn new(action: Action, step_order: i32) -> Self {
        Self {
            action,
            step_order,
            parameters: Vec::new(),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }
}

/// A job file as read by the `cds-worker run` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(flatten)]
    pub job: CurrentJob,
    #[serde(default)]
    pub steps: Vec<JobStepSpec>,
}

/// A step entry in a job file; its order is its position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStepSpec {
    pub action: Action,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl JobSpec {
    /// Steps with their ordinal positions assigned.
    pub fn invocations(&self) -> Vec<StepInvocation> {
        self.steps
            .iter()
            .enumerate()
            .map(|(order, step)| StepInvocation {
                action: step.action.clone(),
                step_order: order as i32,
                parameters: step.parameters.clone(),
            })
            .collect()
    }
}
