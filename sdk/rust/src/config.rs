//! Typed builders for pipeline configurations. Users construct a [`Pipeline`] in code, validate
//! it, and hand the result to the registration endpoint.

use crate::{dag, validate_identifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid argument '{argument}' with value '{value}'; {description}")]
    InvalidArgument {
        argument: String,
        value: String,
        description: String,
    },

    #[error("a cycle was detected creating a dependency from task '{0}' to task '{1}'")]
    TaskCycle(String, String),

    #[error("task '{0}' is listed as a dependency within task '{1}' but does not exist")]
    DependencyNotFound(String, String),

    #[error("pipeline '{0}' must contain at least one task")]
    NoTasks(String),
}

#[derive(Debug, Clone, Display, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RequiredParentStatus {
    Any,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

/// The behavioral fields of a task; shared between the custom and common variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub description: Option<String>,
    pub image: String,
    pub registry_auth: Option<RegistryAuth>,
    pub depends_on: HashMap<String, RequiredParentStatus>,
    pub variables: HashMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub inject_api_token: bool,
}

impl TaskConfig {
    pub fn new(id: &str, image: &str) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            image: image.to_string(),
            registry_auth: None,
            depends_on: HashMap::new(),
            variables: HashMap::new(),
            entrypoint: None,
            command: None,
            inject_api_token: false,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn registry_auth(mut self, user: &str, pass: &str) -> Self {
        self.registry_auth = Some(RegistryAuth {
            user: user.to_string(),
            pass: pass.to_string(),
        });
        self
    }

    pub fn depends_on(mut self, task_id: &str, state: RequiredParentStatus) -> Self {
        self.depends_on.insert(task_id.to_string(), state);
        self
    }

    pub fn variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Inject a run scoped Gofer API token into the container as `GOFER_API_TOKEN`.
    pub fn inject_api_token(mut self, inject: bool) -> Self {
        self.inject_api_token = inject;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("id", &self.id)?;

        Ok(())
    }
}

/// A task within a pipeline. Custom tasks are fully author-defined; common tasks start from an
/// operator-curated definition the author parameterizes. Both carry the same behavioral fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Custom(TaskConfig),
    Common(TaskConfig),
}

impl Task {
    pub fn id(&self) -> &str {
        match self {
            Task::Custom(task) | Task::Common(task) => &task.id,
        }
    }

    pub fn depends_on(&self) -> &HashMap<String, RequiredParentStatus> {
        match self {
            Task::Custom(task) | Task::Common(task) => &task.depends_on,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Task::Custom(task) | Task::Common(task) => task.validate(),
        }
    }
}

/// A declaration that a pipeline wants events from a particular extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// The extension to subscribe to.
    pub extension_id: String,

    /// A unique label for this subscription so a pipeline can subscribe to the same extension
    /// multiple times.
    pub label: String,

    /// Extension specific settings; consult the extension's documentation.
    pub settings: HashMap<String, String>,
}

impl Subscription {
    pub fn new(extension_id: &str, label: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            label: label.to_string(),
            settings: HashMap::new(),
        }
    }

    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }
}

/// A user's pipeline definition: an identifiable DAG of tasks plus the extension subscriptions
/// that trigger it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub parallelism: u64,
    pub tasks: Vec<Task>,
    pub subscriptions: Vec<Subscription>,
}

impl Pipeline {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            parallelism: 0,
            tasks: vec![],
            subscriptions: vec![],
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn parallelism(mut self, parallelism: u64) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn subscriptions(mut self, subscriptions: Vec<Subscription>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Check that the configuration is well formed: valid identifiers, at least one task, every
    /// dependency present, and an acyclic task graph. The server re-runs the same checks on
    /// registration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("id", &self.id)?;

        if self.tasks.is_empty() {
            return Err(ConfigError::NoTasks(self.id.clone()));
        }

        for task in &self.tasks {
            task.validate()?;
        }

        for subscription in &self.subscriptions {
            validate_identifier("label", &subscription.label)?;
        }

        self.is_dag()?;

        Ok(())
    }

    /// Confirms the task dependency tree forms an acyclic graph.
    fn is_dag(&self) -> Result<(), ConfigError> {
        let mut task_dag = dag::Dag::new();

        for task in &self.tasks {
            task_dag.add_node(task.id()).map_err(|_| {
                ConfigError::InvalidArgument {
                    argument: "id".to_string(),
                    value: task.id().to_string(),
                    description: "task ids must be unique within a pipeline".to_string(),
                }
            })?;
        }

        for task in &self.tasks {
            for parent_id in task.depends_on().keys() {
                task_dag
                    .add_edge(parent_id, task.id())
                    .map_err(|err| match err {
                        dag::DagError::EdgeCreatesCycle(from, to) => {
                            ConfigError::TaskCycle(from, to)
                        }
                        _ => ConfigError::DependencyNotFound(
                            parent_id.to_string(),
                            task.id().to_string(),
                        ),
                    })?;
            }
        }

        Ok(())
    }
}

/// Reference a pipeline secret from a task variable; resolved server-side at dispatch time.
pub fn pipeline_secret(key: &str) -> String {
    format!("pipeline_secret{{{{{key}}}}}")
}

/// Reference a global secret from a task variable; resolved server-side at dispatch time.
pub fn global_secret(key: &str) -> String {
    format!("global_secret{{{{{key}}}}}")
}

/// Reference a pipeline object from a task variable; resolved server-side at dispatch time.
pub fn pipeline_object(key: &str) -> String {
    format!("pipeline_object{{{{{key}}}}}")
}

/// Reference a run object from a task variable; resolved server-side at dispatch time.
pub fn run_object(key: &str) -> String {
    format!("run_object{{{{{key}}}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pipeline_passes_validation() {
        let pipeline = Pipeline::new("my_pipeline", "My Pipeline")
            .description("A pipeline with a small diamond of tasks")
            .tasks(vec![
                Task::Custom(TaskConfig::new("task_root", "ubuntu:latest")),
                Task::Custom(
                    TaskConfig::new("task_left", "ubuntu:latest")
                        .depends_on("task_root", RequiredParentStatus::Success),
                ),
                Task::Custom(
                    TaskConfig::new("task_right", "ubuntu:latest")
                        .depends_on("task_root", RequiredParentStatus::Success)
                        .variable("SOME_SECRET", &pipeline_secret("my_key")),
                ),
            ]);

        pipeline.validate().unwrap();
    }

    #[test]
    fn cyclic_pipeline_fails_validation() {
        let pipeline = Pipeline::new("my_pipeline", "My Pipeline").tasks(vec![
            Task::Custom(
                TaskConfig::new("task_one", "ubuntu:latest")
                    .depends_on("task_two", RequiredParentStatus::Any),
            ),
            Task::Custom(
                TaskConfig::new("task_two", "ubuntu:latest")
                    .depends_on("task_one", RequiredParentStatus::Any),
            ),
        ]);

        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, ConfigError::TaskCycle(_, _)));
    }

    #[test]
    fn missing_dependency_fails_validation() {
        let pipeline = Pipeline::new("my_pipeline", "My Pipeline").tasks(vec![Task::Custom(
            TaskConfig::new("task_one", "ubuntu:latest")
                .depends_on("does_not_exist", RequiredParentStatus::Success),
        )]);

        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DependencyNotFound(_, _)));
    }

    #[test]
    fn empty_pipeline_fails_validation() {
        let pipeline = Pipeline::new("my_pipeline", "My Pipeline");

        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, ConfigError::NoTasks(_)));
    }

    #[test]
    fn bad_identifiers_fail_validation() {
        let pipeline = Pipeline::new("bad id with spaces", "My Pipeline")
            .tasks(vec![Task::Custom(TaskConfig::new("task_one", "ubuntu"))]);

        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument { .. }));
    }

    #[test]
    fn interpolation_helpers_emit_expected_markers() {
        assert_eq!(pipeline_secret("key"), "pipeline_secret{{key}}");
        assert_eq!(global_secret("key"), "global_secret{{key}}");
        assert_eq!(pipeline_object("key"), "pipeline_object{{key}}");
        assert_eq!(run_object("key"), "run_object{{key}}");
    }
}
