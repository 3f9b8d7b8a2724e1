use crate::api::{
    epoch_milli, event_utils, pipeline_configs, subscriptions, Api, ApiError,
};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Acquire;
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::error;

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// The version flip has happened and subscription reconciliation is underway.
    Running,

    /// The deployment has finished.
    Complete,
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    Failed,

    Successful,
}

/// A deployment is the atomic transition between two pipeline config versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// Unique, per-pipeline monotonic identifier for the deployment.
    pub deployment_id: u64,

    /// The config version that was live before this deployment; zero on a first deploy.
    pub start_version: u64,

    /// The config version this deployment promoted to live.
    pub end_version: u64,

    /// Time the deployment started in epoch milliseconds.
    pub started: u64,

    /// Time the deployment finished in epoch milliseconds.
    pub ended: u64,

    /// The current state of the deployment within its lifecycle.
    pub state: State,

    /// The final result of the deployment.
    pub status: Status,

    /// More details about the deployment's status.
    pub status_reason: Option<String>,

    /// Log lines recorded while the deployment progressed, including per-subscription
    /// reconciliation results.
    pub logs: Vec<String>,
}

impl TryFrom<storage::deployments::Deployment> for Deployment {
    type Error = anyhow::Error;

    fn try_from(value: storage::deployments::Deployment) -> Result<Self> {
        let started = value.started.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'started' from storage value '{}'",
                value.started
            )
        })?;

        let ended = value.ended.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'ended' from storage value '{}'",
                value.ended
            )
        })?;

        let state = State::from_str(&value.state).with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                value.state
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let status_reason = if value.status_reason.is_empty() {
            None
        } else {
            Some(value.status_reason)
        };

        let logs = serde_json::from_str(&value.logs)
            .context("Could not parse field 'logs' from storage value")?;

        Ok(Deployment {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            deployment_id: value.deployment_id as u64,
            start_version: value.start_version as u64,
            end_version: value.end_version as u64,
            started,
            ended,
            state,
            status,
            status_reason,
            logs,
        })
    }
}

impl Api {
    /// List all deployments for a pipeline, newest first.
    pub async fn list_deployments(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Deployment>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_deployments =
            storage::deployments::list(&mut conn, namespace_id, pipeline_id, offset, limit)
                .await?;

        let mut deployments = vec![];

        for storage_deployment in storage_deployments {
            deployments.push(Deployment::try_from(storage_deployment)?);
        }

        Ok(deployments)
    }

    /// Get a single deployment.
    pub async fn get_deployment(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        deployment_id: u64,
    ) -> Result<Deployment, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_deployment = storage::deployments::get(
            &mut conn,
            namespace_id,
            pipeline_id,
            deployment_id as i64,
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "deployment '{deployment_id}' does not exist for pipeline '{pipeline_id}'"
            )),
            _ => err.into(),
        })?;

        Ok(Deployment::try_from(storage_deployment)?)
    }

    /// Deploy a registered config version: in one transaction the previous live config is
    /// deprecated and the target promoted, then the pipeline's extension subscriptions are
    /// reconciled against the new config's declarations.
    ///
    /// Subscription failures do not roll the version flip back; they land in the deployment's
    /// logs and on the affected subscription records.
    pub async fn deploy_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: u64,
    ) -> Result<Deployment, ApiError> {
        let mut conn = self.storage.conn().await?;

        let target_config =
            storage::pipeline_configs::get(&mut conn, namespace_id, pipeline_id, version as i64)
                .await
                .map_err(|err| match err {
                    storage::StorageError::NotFound => ApiError::NotFound(format!(
                        "config version '{version}' does not exist for pipeline '{pipeline_id}'"
                    )),
                    _ => err.into(),
                })?;

        let target_state = target_config
            .state
            .parse::<pipeline_configs::ConfigState>()
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        if target_state == pipeline_configs::ConfigState::Live {
            return Err(ApiError::FailedPrecondition(format!(
                "config version '{version}' is already live for pipeline '{pipeline_id}'"
            )));
        }

        let live_config =
            match storage::pipeline_configs::get_live(&mut conn, namespace_id, pipeline_id).await {
                Ok(config) => Some(config),
                Err(storage::StorageError::NotFound) => None,
                Err(err) => return Err(err.into()),
            };

        let start_version = live_config.as_ref().map(|c| c.version).unwrap_or(0);

        let latest_deployment_id =
            match storage::deployments::get_latest(&mut conn, namespace_id, pipeline_id).await {
                Ok(deployment) => deployment.deployment_id,
                Err(storage::StorageError::NotFound) => 0,
                Err(err) => return Err(err.into()),
            };

        let deployment = Deployment {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            deployment_id: (latest_deployment_id + 1) as u64,
            start_version: start_version as u64,
            end_version: version,
            started: epoch_milli(),
            ended: 0,
            state: State::Running,
            status: Status::Unknown,
            status_reason: None,
            logs: vec![],
        };

        // The deployment record and the live flip land together or not at all.
        let mut tx = conn
            .begin()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        storage::deployments::insert(
            &mut tx,
            &storage::deployments::Deployment {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                deployment_id: deployment.deployment_id as i64,
                start_version: deployment.start_version as i64,
                end_version: deployment.end_version as i64,
                started: deployment.started.to_string(),
                ended: "0".into(),
                state: deployment.state.to_string(),
                status: deployment.status.to_string(),
                status_reason: "".into(),
                logs: "[]".into(),
            },
        )
        .await?;

        if let Some(live_config) = &live_config {
            storage::pipeline_configs::update(
                &mut tx,
                namespace_id,
                pipeline_id,
                live_config.version,
                storage::pipeline_configs::UpdatableFields {
                    state: Some(pipeline_configs::ConfigState::Deprecated.to_string()),
                    deprecated: Some(epoch_milli().to_string()),
                },
            )
            .await?;
        }

        storage::pipeline_configs::update(
            &mut tx,
            namespace_id,
            pipeline_id,
            version as i64,
            storage::pipeline_configs::UpdatableFields {
                state: Some(pipeline_configs::ConfigState::Live.to_string()),
                deprecated: None,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        drop(conn);

        self.event_bus
            .publish(event_utils::Kind::PipelineDeployStarted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                start_version: deployment.start_version,
                end_version: deployment.end_version,
            })
            .await;

        // Reconcile the extension subscriptions against the new live config. The flip has
        // already happened; whatever goes wrong here is recorded, not rolled back.
        let declared: Vec<pipeline_configs::SubscriptionConfig> =
            serde_json::from_str(&target_config.subscriptions)
                .map_err(|e| ApiError::Internal(e.to_string()))?;

        let logs =
            match subscriptions::reconcile_subscriptions(self, namespace_id, pipeline_id, &declared)
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    error!(
                        namespace_id = namespace_id,
                        pipeline_id = pipeline_id,
                        error = %e,
                        "Could not reconcile subscriptions during deployment"
                    );
                    vec![format!("could not reconcile subscriptions; {e}")]
                }
            };

        let mut conn = self.storage.conn().await?;

        storage::deployments::update(
            &mut conn,
            namespace_id,
            pipeline_id,
            deployment.deployment_id as i64,
            storage::deployments::UpdatableFields {
                ended: Some(epoch_milli().to_string()),
                state: Some(State::Complete.to_string()),
                status: Some(Status::Successful.to_string()),
                logs: Some(
                    serde_json::to_string(&logs)
                        .map_err(|e| ApiError::Internal(e.to_string()))?,
                ),
                ..Default::default()
            },
        )
        .await?;

        self.event_bus
            .publish(event_utils::Kind::PipelineDeployCompleted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                start_version: deployment.start_version,
                end_version: deployment.end_version,
            })
            .await;

        self.get_deployment(namespace_id, pipeline_id, deployment.deployment_id)
            .await
    }
}
