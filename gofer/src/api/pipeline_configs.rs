use crate::api::{
    epoch_milli, event_utils, is_valid_identifier, pipelines, tasks, Api, ApiError,
};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Acquire;
use std::collections::HashMap;
use strum::{Display, EnumString};

/// The deployment state of a config. Used to determine whether a particular config is currently
/// being used or not.
#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ConfigState {
    #[default]
    Unknown,

    /// Has never been deployed.
    Unreleased,

    /// Currently deployed.
    Live,

    /// Has previously been deployed and is now defunct.
    Deprecated,
}

/// A binding, declared inside a pipeline config, from this pipeline to an extension. Deploying
/// the config reconciles these declarations against the extension host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// The name of the extension to subscribe to.
    pub extension_id: String,

    /// A unique label for this particular subscription, allowing a pipeline to subscribe to the
    /// same extension multiple times with different settings.
    pub label: String,

    /// Extension specific settings controlling how the extension treats this subscription.
    pub settings: HashMap<String, String>,
}

/// A representation of the user's configuration settings for a particular pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// The iteration number for this pipeline's configs. Versions are append-only; registering
    /// a config always creates a new version and old versions are never mutated.
    pub version: u64,

    /// Tasks associated with this pipeline, keyed by task id.
    pub tasks: HashMap<String, tasks::Task>,

    /// Extension subscriptions this pipeline declares.
    pub subscriptions: Vec<SubscriptionConfig>,

    /// The deployment state of the config.
    pub state: ConfigState,

    /// Time in epoch milliseconds when this pipeline config was registered.
    pub registered: u64,

    /// Time in epoch milliseconds when this pipeline config was no longer used.
    pub deprecated: u64,
}

impl Config {
    pub fn to_storage(
        &self,
    ) -> Result<(
        storage::pipeline_configs::PipelineConfig,
        Vec<storage::tasks::Task>,
    )> {
        let config = storage::pipeline_configs::PipelineConfig {
            namespace_id: self.namespace_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            version: self.version.try_into()?,
            subscriptions: serde_json::to_string(&self.subscriptions)?,
            state: self.state.to_string(),
            registered: self.registered.to_string(),
            deprecated: self.deprecated.to_string(),
        };

        let mut tasks = vec![];

        for task in self.tasks.values() {
            tasks.push(task.to_storage(
                self.namespace_id.clone(),
                self.pipeline_id.clone(),
                self.version.try_into()?,
            )?);
        }

        Ok((config, tasks))
    }

    pub fn from_storage(
        config: storage::pipeline_configs::PipelineConfig,
        tasks: Vec<storage::tasks::Task>,
    ) -> Result<Self> {
        let registered = config.registered.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'registered' from storage value '{}'",
                config.registered
            )
        })?;

        let deprecated = config.deprecated.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'deprecated' from storage value '{}'",
                config.deprecated
            )
        })?;

        let state = config.state.parse::<ConfigState>().with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                config.state
            )
        })?;

        let subscriptions = serde_json::from_str(&config.subscriptions)
            .context("Could not parse field 'subscriptions' from storage value")?;

        let mut task_map = HashMap::new();

        for storage_task in tasks {
            let task = tasks::Task::from_storage(storage_task)?;
            task_map.insert(task.id().to_string(), task);
        }

        Ok(Config {
            namespace_id: config.namespace_id,
            pipeline_id: config.pipeline_id,
            version: config.version.try_into()?,
            tasks: task_map,
            subscriptions,
            state,
            registered,
            deprecated,
        })
    }
}

/// Every new pipeline config passes through here before registration. Identifier grammar,
/// non-empty task set, parent existence, and graph acyclicity are all enforced server-side
/// regardless of what the client sdk already checked.
pub fn validate_config(
    pipeline_id: &str,
    tasks: &HashMap<String, tasks::Task>,
    subscriptions: &[SubscriptionConfig],
) -> Result<(), ApiError> {
    is_valid_identifier(pipeline_id)?;

    if tasks.is_empty() {
        return Err(ApiError::InvalidArgument(format!(
            "pipeline '{pipeline_id}' declares no tasks; pipelines must contain at least one task"
        )));
    }

    for task in tasks.values() {
        is_valid_identifier(task.id())?;
    }

    for subscription in subscriptions {
        is_valid_identifier(&subscription.label)?;
        is_valid_identifier(&subscription.extension_id)?;
    }

    let mut dag = gofer_sdk::dag::Dag::new();

    for task_id in tasks.keys() {
        dag.add_node(task_id).map_err(|_| {
            ApiError::InvalidArgument(format!("task '{task_id}' is declared more than once"))
        })?;
    }

    for task in tasks.values() {
        for parent_id in task.depends_on().keys() {
            dag.add_edge(parent_id, task.id())
                .map_err(|err| match err {
                    gofer_sdk::dag::DagError::EntityNotFound => ApiError::InvalidArgument(format!(
                        "task '{}' depends on task '{parent_id}' which does not exist in the same config",
                        task.id()
                    )),
                    gofer_sdk::dag::DagError::EdgeCreatesCycle(from, to) => {
                        ApiError::InvalidArgument(format!(
                            "task dependency from '{from}' to '{to}' creates a cycle; task graphs must be acyclic"
                        ))
                    }
                    gofer_sdk::dag::DagError::EntityExists => {
                        ApiError::InvalidArgument(format!(
                            "task '{}' declares a duplicate dependency on '{parent_id}'",
                            task.id()
                        ))
                    }
                })?;
        }
    }

    Ok(())
}

impl Api {
    /// Register a new config version for a pipeline. First-time registrations also create the
    /// pipeline itself. The new version starts out `unreleased`; a subsequent deploy promotes
    /// it to `live`.
    pub async fn register_config(
        &self,
        namespace_id: &str,
        config: gofer_sdk::config::Pipeline,
    ) -> Result<Config, ApiError> {
        let pipeline_id = config.id.clone();

        let tasks: HashMap<String, tasks::Task> = config
            .tasks
            .into_iter()
            .map(tasks::Task::from)
            .map(|task| (task.id().to_string(), task))
            .collect();

        let subscriptions: Vec<SubscriptionConfig> = config
            .subscriptions
            .into_iter()
            .map(|sub| SubscriptionConfig {
                extension_id: sub.extension_id,
                label: sub.label,
                settings: sub.settings,
            })
            .collect();

        validate_config(&pipeline_id, &tasks, &subscriptions)?;

        let mut conn = self.storage.conn().await?;

        // Make sure the namespace exists before we go any further.
        storage::namespaces::get(&mut conn, namespace_id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("namespace '{namespace_id}' does not exist"))
                }
                _ => err.into(),
            })?;

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let mut newly_created_pipeline = false;

        match storage::pipeline_metadata::get(&mut tx, namespace_id, &pipeline_id).await {
            Ok(_) => {
                storage::pipeline_metadata::update(
                    &mut tx,
                    namespace_id,
                    &pipeline_id,
                    storage::pipeline_metadata::UpdatableFields {
                        name: Some(config.name.clone()),
                        description: Some(config.description.clone().unwrap_or_default()),
                        parallelism: Some(config.parallelism as i64),
                        modified: epoch_milli().to_string(),
                        ..Default::default()
                    },
                )
                .await?;
            }
            Err(storage::StorageError::NotFound) => {
                newly_created_pipeline = true;

                storage::pipeline_metadata::insert(
                    &mut tx,
                    &storage::pipeline_metadata::PipelineMetadata {
                        namespace_id: namespace_id.into(),
                        pipeline_id: pipeline_id.clone(),
                        name: config.name.clone(),
                        description: config.description.clone().unwrap_or_default(),
                        parallelism: config.parallelism as i64,
                        state: pipelines::State::Active.to_string(),
                        created: epoch_milli().to_string(),
                        modified: "0".into(),
                    },
                )
                .await?;
            }
            Err(err) => return Err(err.into()),
        }

        let latest_version =
            match storage::pipeline_configs::get_latest(&mut tx, namespace_id, &pipeline_id).await
            {
                Ok(config) => config.version,
                Err(storage::StorageError::NotFound) => 0,
                Err(err) => return Err(err.into()),
            };

        let new_config = Config {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.clone(),
            version: (latest_version + 1) as u64,
            tasks,
            subscriptions,
            state: ConfigState::Unreleased,
            registered: epoch_milli(),
            deprecated: 0,
        };

        let (storage_config, storage_tasks) = new_config.to_storage()?;

        storage::pipeline_configs::insert(&mut tx, &storage_config).await?;

        for storage_task in storage_tasks {
            storage::tasks::insert(&mut tx, &storage_task).await?;
        }

        tx.commit()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        if newly_created_pipeline {
            self.event_bus
                .publish(event_utils::Kind::PipelineRegistered {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.clone(),
                })
                .await;
        }

        self.event_bus
            .publish(event_utils::Kind::PipelineConfigRegistered {
                namespace_id: namespace_id.into(),
                pipeline_id,
                version: new_config.version,
            })
            .await;

        Ok(new_config)
    }

    /// List every registered config version for a pipeline, newest first.
    pub async fn list_configs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Config>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_configs =
            storage::pipeline_configs::list(&mut conn, namespace_id, pipeline_id, offset, limit)
                .await?;

        let mut configs = vec![];

        for storage_config in storage_configs {
            let storage_tasks = storage::tasks::list(
                &mut conn,
                namespace_id,
                pipeline_id,
                storage_config.version,
            )
            .await?;

            configs.push(Config::from_storage(storage_config, storage_tasks)?);
        }

        Ok(configs)
    }

    /// Get a single config version; version 0 returns the latest.
    pub async fn get_config(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: u64,
    ) -> Result<Config, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_config = if version == 0 {
            storage::pipeline_configs::get_latest(&mut conn, namespace_id, pipeline_id).await
        } else {
            storage::pipeline_configs::get(&mut conn, namespace_id, pipeline_id, version as i64)
                .await
        }
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "config version '{version}' does not exist for pipeline '{pipeline_id}'"
            )),
            _ => err.into(),
        })?;

        let storage_tasks = storage::tasks::list(
            &mut conn,
            namespace_id,
            pipeline_id,
            storage_config.version,
        )
        .await?;

        Ok(Config::from_storage(storage_config, storage_tasks)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tasks::{RequiredParentStatus, Task, TaskDetails};

    fn task(id: &str, depends_on: &[(&str, RequiredParentStatus)]) -> (String, Task) {
        (
            id.to_string(),
            Task::Custom(TaskDetails {
                id: id.to_string(),
                description: "".into(),
                image: "ubuntu:latest".into(),
                registry_auth: None,
                depends_on: depends_on
                    .iter()
                    .map(|(parent, status)| (parent.to_string(), status.clone()))
                    .collect(),
                variables: vec![],
                entrypoint: None,
                command: None,
                inject_api_token: false,
            }),
        )
    }

    #[test]
    fn rejects_empty_task_set() {
        let result = validate_config("some_pipeline", &HashMap::new(), &[]).unwrap_err();
        assert!(matches!(result, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_missing_parent() {
        let tasks = HashMap::from([task("task_one", &[("ghost", RequiredParentStatus::Success)])]);

        let result = validate_config("some_pipeline", &tasks, &[]).unwrap_err();
        assert!(matches!(result, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_cyclic_graph() {
        let tasks = HashMap::from([
            task("task_one", &[("task_two", RequiredParentStatus::Any)]),
            task("task_two", &[("task_one", RequiredParentStatus::Any)]),
        ]);

        let result = validate_config("some_pipeline", &tasks, &[]).unwrap_err();
        assert!(matches!(result, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let tasks = HashMap::from([task("task_one", &[])]);

        let result = validate_config("bad-pipeline-id", &tasks, &[]).unwrap_err();
        assert!(matches!(result, ApiError::InvalidArgument(_)));

        let tasks = HashMap::from([task("x", &[])]);
        let result = validate_config("some_pipeline", &tasks, &[]).unwrap_err();
        assert!(matches!(result, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn accepts_valid_diamond() {
        let tasks = HashMap::from([
            task("task_root", &[]),
            task("task_left", &[("task_root", RequiredParentStatus::Success)]),
            task("task_right", &[("task_root", RequiredParentStatus::Success)]),
            task(
                "task_join",
                &[
                    ("task_left", RequiredParentStatus::Success),
                    ("task_right", RequiredParentStatus::Any),
                ],
            ),
        ]);

        validate_config("some_pipeline", &tasks, &[]).unwrap();
    }
}
