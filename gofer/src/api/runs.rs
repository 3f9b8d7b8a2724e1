use crate::api::{
    epoch_milli, event_utils, pipeline_configs, pipelines, run_utils, task_executions, Api,
    ApiError, Variable, VariableSource,
};
use crate::{scheduler, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, error};

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    /// Run is created but has yet to launch task executions.
    #[default]
    Pending,

    /// Task executions are being driven towards completion.
    Running,

    /// All task executions have reached a terminal state.
    Complete,
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Only state=complete runs hold a concrete status; everything else is unknown.
    #[default]
    Unknown,

    /// Every non-skipped task execution completed successfully.
    Successful,

    /// One or more task executions failed.
    Failed,

    /// One or more task executions were cancelled and none failed.
    Cancelled,
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum StatusReasonType {
    #[default]
    Unknown,

    /// One or more task executions exited abnormally.
    AbnormalExit,

    /// The scheduler could not be reached or reported an infrastructure fault.
    SchedulerError,

    /// The run was in an invalid state to begin execution.
    FailedPrecondition,

    /// The run was cancelled by a user.
    Cancelled,

    /// Gofer lost track of one or more task executions.
    Orphaned,

    /// An internal fault left the run unable to make progress.
    Internal,
}

/// Extra details on why a run landed in its final status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    pub reason: StatusReasonType,
    pub description: String,
}

/// Who or what kicked off a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initiator {
    Human {
        user: String,
    },
    Bot {
        name: String,
    },
    Extension {
        extension_id: String,
        label: String,
    },
}

/// A run is one instance of a pipeline execution at a specific config version. Runs own their
/// task executions; re-running a pipeline always allocates a fresh run id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// Unique, per-pipeline monotonic identifier for the run.
    pub run_id: u64,

    /// Which version of the pipeline config this run executes.
    pub pipeline_config_version: u64,

    /// Time of run creation in epoch milliseconds.
    pub started: u64,

    /// Time the run reached a terminal state in epoch milliseconds.
    pub ended: u64,

    /// The current state of the run within its lifecycle.
    pub state: State,

    /// The final result of the run; unknown until the run completes.
    pub status: Status,

    /// More details on the run's status.
    pub status_reason: Option<StatusReason>,

    /// Who started the run.
    pub initiator: Initiator,

    /// Variables to be injected into each task execution of this run.
    pub variables: Vec<Variable>,

    /// The id of the short-lived API token injected into this run's containers, if any task
    /// requested one.
    pub token_id: Option<String>,

    /// Whether the objects stored at the run level have been removed by the expiry job.
    pub store_objects_expired: bool,
}

impl Run {
    pub fn new(
        namespace_id: &str,
        pipeline_id: &str,
        pipeline_config_version: u64,
        initiator: Initiator,
        variables: Vec<Variable>,
        token_id: Option<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id: 0,
            pipeline_config_version,
            started: epoch_milli(),
            ended: 0,
            state: State::Pending,
            status: Status::Unknown,
            status_reason: None,
            initiator,
            variables,
            token_id,
            store_objects_expired: false,
        }
    }
}

impl TryFrom<storage::runs::Run> for Run {
    type Error = anyhow::Error;

    fn try_from(value: storage::runs::Run) -> Result<Self> {
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
            serde_json::from_str(&value.status_reason)
                .context("Could not parse field 'status_reason' from storage value")?
        };

        let initiator = serde_json::from_str(&value.initiator)
            .context("Could not parse field 'initiator' from storage value")?;

        let variables = serde_json::from_str(&value.variables)
            .context("Could not parse field 'variables' from storage value")?;

        Ok(Run {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as u64,
            pipeline_config_version: value.pipeline_config_version as u64,
            started,
            ended,
            state,
            status,
            status_reason,
            initiator,
            variables,
            token_id: value.token_id,
            store_objects_expired: value.store_objects_expired,
        })
    }
}

impl TryFrom<Run> for storage::runs::Run {
    type Error = anyhow::Error;

    fn try_from(value: Run) -> Result<Self> {
        let status_reason = match &value.status_reason {
            Some(reason) => serde_json::to_string(reason)
                .context("Could not serialize field 'status_reason' into storage value")?,
            None => String::new(),
        };

        Ok(Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as i64,
            pipeline_config_version: value.pipeline_config_version as i64,
            started: value.started.to_string(),
            ended: value.ended.to_string(),
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason,
            initiator: serde_json::to_string(&value.initiator)
                .context("Could not serialize field 'initiator' into storage value")?,
            variables: serde_json::to_string(&value.variables)
                .context("Could not serialize field 'variables' into storage value")?,
            token_id: value.token_id,
            store_objects_expired: value.store_objects_expired,
        })
    }
}

impl Api {
    /// List runs for a pipeline, newest first.
    pub async fn list_runs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Run>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_runs =
            storage::runs::list(&mut conn, namespace_id, pipeline_id, offset, limit).await?;

        let mut runs = vec![];

        for storage_run in storage_runs {
            runs.push(Run::try_from(storage_run)?);
        }

        Ok(runs)
    }

    /// Get a run by id.
    pub async fn get_run(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
    ) -> Result<Run, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_run = storage::runs::get(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => ApiError::NotFound(format!(
                    "run '{run_id}' does not exist for pipeline '{pipeline_id}'"
                )),
                _ => err.into(),
            })?;

        Ok(Run::try_from(storage_run)?)
    }

    /// Start a new run for a pipeline against its live config.
    ///
    /// The extra variables map gets layered on top of config-sourced variables; its entries are
    /// tagged by where they came from (the initiator).
    pub async fn start_run(
        self: &Arc<Self>,
        namespace_id: &str,
        pipeline_id: &str,
        initiator: Initiator,
        variables: HashMap<String, String>,
    ) -> Result<Run, ApiError> {
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

        let metadata = pipelines::Metadata::try_from(storage_metadata)?;

        if metadata.state != pipelines::State::Active {
            return Err(ApiError::FailedPrecondition(format!(
                "pipeline '{pipeline_id}' is not active; cannot start a new run"
            )));
        }

        let live_config =
            match storage::pipeline_configs::get_live(&mut conn, namespace_id, pipeline_id).await {
                Ok(config) => config,
                Err(storage::StorageError::NotFound) => {
                    return Err(ApiError::FailedPrecondition(format!(
                        "pipeline '{pipeline_id}' has no live config; deploy a config before starting runs"
                    )));
                }
                Err(err) => return Err(err.into()),
            };

        let storage_tasks =
            storage::tasks::list(&mut conn, namespace_id, pipeline_id, live_config.version)
                .await?;

        let config = pipeline_configs::Config::from_storage(live_config, storage_tasks)?;

        // The parallelism guard is evaluated at start only; once admitted a run is never
        // preempted. Zero means unlimited for both the pipeline and the global setting.
        let global_limit = self.conf.api.run_parallelism_limit;
        let mut limit = metadata.parallelism;

        if limit == 0 || (global_limit > 0 && limit > global_limit) {
            limit = global_limit;
        }

        if limit > 0 {
            let recent_runs = storage::runs::list(&mut conn, namespace_id, pipeline_id, 0, 0)
                .await?;

            let in_progress = recent_runs
                .iter()
                .filter(|run| run.state != State::Complete.to_string())
                .count() as u64;

            if in_progress >= limit {
                return Err(ApiError::FailedPrecondition(format!(
                    "pipeline '{pipeline_id}' has reached its parallelism limit of {limit}; \
                     wait for a run to finish or cancel one"
                )));
            }
        }

        let variable_source = match &initiator {
            Initiator::Extension { .. } => VariableSource::Extension,
            _ => VariableSource::RunOptions,
        };

        let run_variables: Vec<Variable> = variables
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value,
                source: variable_source.clone(),
            })
            .collect();

        // If any task asks for an API token we mint one scoped to this run's namespace up front
        // so it can be injected at dispatch.
        let needs_api_token = config.tasks.values().any(|task| task.inject_api_token());

        let mut run_token = None;

        if needs_api_token {
            let (secret, token) = self
                .create_run_token(namespace_id, pipeline_id)
                .await?;
            run_token = Some(run_utils::RunToken {
                token_id: token.id,
                secret,
            });
        }

        let new_run = Run::new(
            namespace_id,
            pipeline_id,
            config.version,
            initiator,
            run_variables,
            run_token.as_ref().map(|token| token.token_id.clone()),
        );

        let new_run_storage = new_run
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?;

        let run_id = storage::runs::insert(&mut conn, &new_run_storage).await?;

        let mut new_run = new_run;
        new_run.run_id = run_id as u64;

        self.event_bus
            .publish(event_utils::Kind::RunStarted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id: new_run.run_id,
            })
            .await;

        // Materialize one task execution per configured task before anything launches. If we
        // can't record the full set we fail the run as a whole rather than leave half-state.
        let mut executions = vec![];

        for task in config.tasks.values() {
            let execution = task_executions::TaskExecution::new(
                namespace_id,
                pipeline_id,
                new_run.run_id,
                task.clone(),
            );

            let storage_execution = execution
                .clone()
                .try_into()
                .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?;

            if let Err(e) = storage::task_executions::insert(&mut conn, &storage_execution).await {
                error!(
                    namespace_id = namespace_id,
                    pipeline_id = pipeline_id,
                    run_id = new_run.run_id,
                    task_id = task.id(),
                    error = %e,
                    "Could not materialize task execution; failing run"
                );

                let _ = storage::runs::update(
                    &mut conn,
                    namespace_id,
                    pipeline_id,
                    run_id,
                    storage::runs::UpdatableFields {
                        ended: Some(epoch_milli().to_string()),
                        state: Some(State::Complete.to_string()),
                        status: Some(Status::Failed.to_string()),
                        status_reason: serde_json::to_string(&StatusReason {
                            reason: StatusReasonType::Internal,
                            description:
                                "Could not record the run's task executions; the run was aborted before any task started"
                                    .into(),
                        })
                        .ok(),
                        ..Default::default()
                    },
                )
                .await;

                return Err(ApiError::Internal(format!(
                    "could not materialize task executions for run '{run_id}'; {e}"
                )));
            }

            self.event_bus
                .publish(event_utils::Kind::TaskRunCreated {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.into(),
                    run_id: new_run.run_id,
                    task_id: task.id().to_string(),
                })
                .await;

            executions.push(execution);
        }

        drop(conn);

        // Hand the run off to its shepherd; it owns the run from here to the terminal state.
        let shepherd = Arc::new(run_utils::Shepherd::new(
            self.clone(),
            metadata,
            config,
            new_run.clone(),
            executions,
            run_token,
        ));

        tokio::spawn(shepherd.execute_task_tree());

        Ok(new_run)
    }

    /// Cancel a run.
    ///
    /// Cancellation marks intent on the run, asks the scheduler to stop every started container
    /// (gracefully unless `force` is set), and lets the normal completion observers drive each
    /// task execution to its terminal state.
    pub async fn cancel_run(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        force: bool,
    ) -> Result<(), ApiError> {
        let run = self.get_run(namespace_id, pipeline_id, run_id).await?;

        if run.state == State::Complete {
            debug!(
                namespace_id = namespace_id,
                pipeline_id = pipeline_id,
                run_id = run_id,
                "Cancellation requested for an already complete run; nothing to do"
            );
            return Ok(());
        }

        // Mark intent first so that waiting tasks observe the cancellation on their next
        // evaluation even before their containers exist.
        if let Some(cancellation) = self
            .in_flight_runs
            .get(&run_utils::run_key(namespace_id, pipeline_id, run_id))
        {
            cancellation.cancel();
        }

        self.event_bus
            .publish(event_utils::Kind::RunCancellationStarted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id,
                force,
            })
            .await;

        let timeout = if force {
            0
        } else {
            self.conf.api.task_execution_stop_timeout as i64
        };

        let mut conn = self.storage.conn().await?;

        let executions =
            storage::task_executions::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
                .await?;

        for execution in executions {
            let state = task_executions::State::from_str(&execution.state)
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            if state != task_executions::State::Running {
                continue;
            }

            self.event_bus
                .publish(event_utils::Kind::TaskRunCancellationStarted {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.into(),
                    run_id,
                    task_id: execution.task_id.clone(),
                    timeout: timeout as u64,
                })
                .await;

            let container_name = task_executions::task_execution_container_id(
                namespace_id,
                pipeline_id,
                run_id,
                &execution.task_id,
            );

            if let Err(e) = self
                .scheduler
                .stop_container(scheduler::StopContainerRequest {
                    name: container_name,
                    timeout,
                })
                .await
            {
                // The container may have exited on its own in the meantime; the observer will
                // pick up whatever state it landed in.
                debug!(
                    namespace_id = namespace_id,
                    pipeline_id = pipeline_id,
                    run_id = run_id,
                    task_id = execution.task_id,
                    error = %e,
                    "Could not stop container during run cancellation"
                );
            }
        }

        Ok(())
    }

    /// Cancel every non-terminal run for a pipeline. Used as a precursor to pipeline deletion.
    pub async fn cancel_all_runs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        force: bool,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_runs = storage::runs::list(&mut conn, namespace_id, pipeline_id, 0, 0).await?;

        drop(conn);

        for storage_run in storage_runs {
            if storage_run.state == State::Complete.to_string() {
                continue;
            }

            self.cancel_run(
                namespace_id,
                pipeline_id,
                storage_run.run_id as u64,
                force,
            )
            .await?;
        }

        Ok(())
    }
}
