use crate::api::{Variable, VariableSource};
use crate::{scheduler, storage};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RequiredParentStatus {
    #[default]
    Unknown,

    /// Parent must have completed with a concrete outcome: successful or failed.
    Any,

    /// Parent must have completed successfully.
    Success,

    /// Parent must have failed.
    Failure,
}

impl From<gofer_sdk::config::RequiredParentStatus> for RequiredParentStatus {
    fn from(value: gofer_sdk::config::RequiredParentStatus) -> Self {
        match value {
            gofer_sdk::config::RequiredParentStatus::Any => RequiredParentStatus::Any,
            gofer_sdk::config::RequiredParentStatus::Success => RequiredParentStatus::Success,
            gofer_sdk::config::RequiredParentStatus::Failure => RequiredParentStatus::Failure,
        }
    }
}

/// Private repositories sometimes require authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

impl From<RegistryAuth> for scheduler::RegistryAuth {
    fn from(value: RegistryAuth) -> Self {
        Self {
            user: value.user,
            pass: value.pass,
        }
    }
}

impl From<gofer_sdk::config::RegistryAuth> for RegistryAuth {
    fn from(value: gofer_sdk::config::RegistryAuth) -> Self {
        Self {
            user: value.user,
            pass: value.pass,
        }
    }
}

/// The behavioral fields every task variant carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDetails {
    /// Unique identifier for the task.
    pub id: String,

    /// Short description about the workload.
    pub description: String,

    /// Which container image to run for this specific task.
    ///
    /// Example: "ubuntu:latest"
    pub image: String,

    /// Auth credentials for the image's registry.
    pub registry_auth: Option<RegistryAuth>,

    /// Which other tasks (by id) this task depends on, and the completion outcome that
    /// dependency requires.
    pub depends_on: HashMap<String, RequiredParentStatus>,

    /// Variables which will be passed in as env vars to the task.
    pub variables: Vec<Variable>,

    /// Command to run on init of container; follows normal docker convention for entrypoint.
    pub entrypoint: Option<Vec<String>>,

    /// Command to run on init of container; follows normal docker convention of command.
    pub command: Option<Vec<String>>,

    /// Whether to inject a run specific Gofer API token. Useful for using the Gofer API within
    /// the container.
    pub inject_api_token: bool,
}

/// A task represents a particular workload within a pipeline. Tasks are composable within a
/// larger pipeline, meaning they can be run before, after, or alongside other tasks. Tasks are
/// the lowest level of the Gofer hierarchy and are what Gofer references to see how a user wants
/// their workload handled.
///
/// Tasks come in two flavors sharing the same behavioral fields: custom tasks are fully defined
/// by the pipeline author; common tasks start from an operator-curated definition that the
/// pipeline author parameterizes. Downstream code dispatches on the tag via the accessor
/// methods below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Custom(TaskDetails),
    Common(TaskDetails),
}

impl Task {
    fn details(&self) -> &TaskDetails {
        match self {
            Task::Custom(details) => details,
            Task::Common(details) => details,
        }
    }

    pub fn id(&self) -> &str {
        &self.details().id
    }

    pub fn description(&self) -> &str {
        &self.details().description
    }

    pub fn image(&self) -> &str {
        &self.details().image
    }

    pub fn registry_auth(&self) -> Option<&RegistryAuth> {
        self.details().registry_auth.as_ref()
    }

    pub fn depends_on(&self) -> &HashMap<String, RequiredParentStatus> {
        &self.details().depends_on
    }

    pub fn variables(&self) -> &[Variable] {
        &self.details().variables
    }

    pub fn entrypoint(&self) -> Option<&Vec<String>> {
        self.details().entrypoint.as_ref()
    }

    pub fn command(&self) -> Option<&Vec<String>> {
        self.details().command.as_ref()
    }

    pub fn inject_api_token(&self) -> bool {
        self.details().inject_api_token
    }

    pub fn to_storage(
        &self,
        namespace_id: String,
        pipeline_id: String,
        version: i64,
    ) -> Result<storage::tasks::Task> {
        Ok(storage::tasks::Task {
            namespace_id,
            pipeline_id,
            pipeline_config_version: version,
            task_id: self.id().to_string(),
            task: serde_json::to_string(self)?,
        })
    }

    pub fn from_storage(storage_task: storage::tasks::Task) -> Result<Self> {
        let task = serde_json::from_str(&storage_task.task)?;
        Ok(task)
    }
}

impl From<gofer_sdk::config::Task> for Task {
    fn from(value: gofer_sdk::config::Task) -> Self {
        let (details, common) = match value {
            gofer_sdk::config::Task::Custom(task) => (task, false),
            gofer_sdk::config::Task::Common(task) => (task, true),
        };

        let details = TaskDetails {
            id: details.id,
            description: details.description.unwrap_or_default(),
            image: details.image,
            registry_auth: details.registry_auth.map(RegistryAuth::from),
            depends_on: details
                .depends_on
                .into_iter()
                .map(|(task_id, status)| (task_id, RequiredParentStatus::from(status)))
                .collect(),
            variables: details
                .variables
                .into_iter()
                .map(|(key, value)| Variable {
                    key,
                    value,
                    source: VariableSource::PipelineConfig,
                })
                .collect(),
            entrypoint: details.entrypoint,
            command: details.command,
            inject_api_token: details.inject_api_token,
        };

        if common {
            Task::Common(details)
        } else {
            Task::Custom(details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        Task::Custom(TaskDetails {
            id: "task_one".to_string(),
            description: "A test task".to_string(),
            image: "ubuntu:latest".to_string(),
            registry_auth: None,
            depends_on: HashMap::from([("task_zero".into(), RequiredParentStatus::Success)]),
            variables: vec![Variable {
                key: "SOME_VAR".into(),
                value: "value".into(),
                source: VariableSource::PipelineConfig,
            }],
            entrypoint: Some(vec!["/entrypoint.sh".to_string()]),
            command: Some(vec!["run".to_string(), "--option".to_string()]),
            inject_api_token: true,
        })
    }

    #[test]
    fn storage_serialization_round_trips() {
        let task = test_task();

        let storage_task = task
            .to_storage("default".to_string(), "simple".to_string(), 1)
            .unwrap();

        assert_eq!(storage_task.task_id, "task_one");
        assert_eq!(storage_task.pipeline_config_version, 1);

        let reconstructed = Task::from_storage(storage_task).unwrap();
        assert_eq!(reconstructed, task);
    }

    #[test]
    fn variants_expose_the_same_behavioral_fields() {
        let custom = test_task();

        let common = match custom.clone() {
            Task::Custom(details) => Task::Common(details),
            Task::Common(_) => unreachable!(),
        };

        assert_eq!(custom.id(), common.id());
        assert_eq!(custom.image(), common.image());
        assert_eq!(custom.depends_on(), common.depends_on());
        assert_eq!(custom.inject_api_token(), common.inject_api_token());
    }
}
