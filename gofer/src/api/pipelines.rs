use crate::api::{epoch_milli, event_utils, pipeline_configs, runs, Api, ApiError};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Acquire;
use strum::{Display, EnumString};

/// The current state of the pipeline. Pipelines can be disabled to stop execution of new
/// runs while keeping all history.
#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Pipeline is enabled and able to start new runs.
    Active,

    /// Pipeline is disabled and not able to start new runs. Any existing runs are unaffected.
    Disabled,
}

/// Details about the pipeline itself, not including the configuration that the user can change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// Humanized name for the pipeline.
    pub name: String,

    /// Description of the pipeline's purpose and other details.
    pub description: String,

    /// The amount of runs allowed to happen at any given time. 0 defers to the global limit.
    pub parallelism: u64,

    /// The current state of the pipeline.
    pub state: State,

    /// Time in epoch milliseconds when the pipeline was registered.
    pub created: u64,

    /// Time in epoch milliseconds when the pipeline was last modified.
    pub modified: u64,
}

impl TryFrom<storage::pipeline_metadata::PipelineMetadata> for Metadata {
    type Error = anyhow::Error;

    fn try_from(value: storage::pipeline_metadata::PipelineMetadata) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        let state = value.state.parse::<State>().with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                value.state
            )
        })?;

        Ok(Metadata {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            name: value.name,
            description: value.description,
            parallelism: value.parallelism as u64,
            state,
            created,
            modified,
        })
    }
}

impl From<Metadata> for storage::pipeline_metadata::PipelineMetadata {
    fn from(value: Metadata) -> Self {
        Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            name: value.name,
            description: value.description,
            parallelism: value.parallelism as i64,
            state: value.state.to_string(),
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        }
    }
}

/// A pipeline is a graph of containers that accomplish some goal. Pipelines are created via a
/// pipeline configuration and updated via deployments of new configuration versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub metadata: Metadata,
    pub config: pipeline_configs::Config,
}

impl Api {
    /// List the pipelines registered under a namespace.
    pub async fn list_pipelines(
        &self,
        namespace_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Metadata>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_pipelines =
            storage::pipeline_metadata::list(&mut conn, namespace_id, offset, limit).await?;

        let mut pipelines = vec![];

        for storage_pipeline in storage_pipelines {
            pipelines.push(Metadata::try_from(storage_pipeline)?);
        }

        Ok(pipelines)
    }

    /// Get a pipeline's metadata together with its currently deployed (live) config. Falls back
    /// to the latest registered config when nothing has been deployed yet.
    pub async fn get_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<Pipeline, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_metadata =
            storage::pipeline_metadata::get(&mut conn, namespace_id, pipeline_id)
                .await
                .map_err(|err| match err {
                    storage::StorageError::NotFound => ApiError::NotFound(format!(
                        "pipeline '{pipeline_id}' does not exist in namespace '{namespace_id}'"
                    )),
                    _ => err.into(),
                })?;

        let metadata = Metadata::try_from(storage_metadata)?;

        let storage_config =
            match storage::pipeline_configs::get_live(&mut conn, namespace_id, pipeline_id).await {
                Ok(config) => config,
                Err(storage::StorageError::NotFound) => {
                    storage::pipeline_configs::get_latest(&mut conn, namespace_id, pipeline_id)
                        .await?
                }
                Err(err) => return Err(err.into()),
            };

        let storage_tasks = storage::tasks::list(
            &mut conn,
            namespace_id,
            pipeline_id,
            storage_config.version,
        )
        .await?;

        let config = pipeline_configs::Config::from_storage(storage_config, storage_tasks)?;

        Ok(Pipeline { metadata, config })
    }

    /// Re-enable a disabled pipeline.
    pub async fn enable_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<(), ApiError> {
        self.set_pipeline_state(namespace_id, pipeline_id, State::Active)
            .await?;

        self.event_bus
            .publish(event_utils::Kind::PipelineEnabled {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            })
            .await;

        Ok(())
    }

    /// Disable a pipeline; new runs are rejected but any in-flight runs continue to completion
    /// and all history is preserved.
    pub async fn disable_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<(), ApiError> {
        self.set_pipeline_state(namespace_id, pipeline_id, State::Disabled)
            .await?;

        self.event_bus
            .publish(event_utils::Kind::PipelineDisabled {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            })
            .await;

        Ok(())
    }

    async fn set_pipeline_state(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        state: State,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::pipeline_metadata::update(
            &mut conn,
            namespace_id,
            pipeline_id,
            storage::pipeline_metadata::UpdatableFields {
                state: Some(state.to_string()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "pipeline '{pipeline_id}' does not exist in namespace '{namespace_id}'"
            )),
            _ => err.into(),
        })
    }

    /// Delete a pipeline and everything it owns.
    ///
    /// Deletion requires every run to have reached a terminal state first; callers cancel
    /// in-flight runs before retrying.
    pub async fn delete_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        let recent_runs =
            storage::runs::list(&mut conn, namespace_id, pipeline_id, 0, 0).await?;

        for run in recent_runs {
            let state = run
                .state
                .parse::<runs::State>()
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            if state != runs::State::Complete {
                return Err(ApiError::FailedPrecondition(format!(
                    "pipeline '{pipeline_id}' still has run '{}' in progress; cancel all runs before deleting",
                    run.run_id
                )));
            }
        }

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        storage::pipeline_metadata::delete(&mut tx, namespace_id, pipeline_id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => ApiError::NotFound(format!(
                    "pipeline '{pipeline_id}' does not exist in namespace '{namespace_id}'"
                )),
                _ => err.into(),
            })?;

        tx.commit()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        self.event_bus
            .publish(event_utils::Kind::PipelineDeleted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            })
            .await;

        Ok(())
    }
}
