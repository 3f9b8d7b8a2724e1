use crate::api::{
    epoch_milli, event_utils, tasks, Api, ApiError, Variable, GOFER_EOF,
};
use crate::{scheduler, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use strum::{Display, EnumString};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, error};

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Pre-scheduling validation and variable composition.
    Processing,

    /// Waiting on parent task executions to complete.
    Waiting,

    /// Launched on the scheduler and being observed.
    Running,

    /// Reached a terminal state.
    Complete,
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Only state=complete task executions hold a concrete status.
    #[default]
    Unknown,

    /// The container exited cleanly.
    Successful,

    /// The container exited abnormally or could not be driven to completion.
    Failed,

    /// The task execution was stopped on request before it could finish.
    Cancelled,

    /// The task execution never ran because its dependencies can no longer be satisfied.
    Skipped,
}

impl Status {
    /// Whether this status satisfies the `Any` parent predicate: the parent must have actually
    /// run to a concrete outcome, so skipped and cancelled parents do not qualify.
    pub fn is_concrete_outcome(&self) -> bool {
        matches!(self, Status::Successful | Status::Failed)
    }
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum StatusReasonType {
    #[default]
    Unknown,

    /// The container exited with a non-zero exit code.
    AbnormalExit,

    /// The scheduler could not start or report on the container.
    SchedulerError,

    /// The task execution was in an invalid state to run; most commonly its parents completed
    /// in states that permanently fail its dependency predicates.
    FailedPrecondition,

    /// The task execution was cancelled on request.
    Cancelled,

    /// The scheduler never acknowledged the container within the orphan timeout; Gofer lost
    /// track of it.
    Orphaned,

    /// An internal fault stopped the task execution from being driven further.
    Internal,
}

/// Extra details on why a task execution landed in its final status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    pub reason: StatusReasonType,
    pub description: String,
}

/// A task execution is the execution record of one configured task within a single run. It
/// snapshots the task definition it executed along with the full composed variable set the
/// container received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskExecution {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// Which run this task execution belongs to.
    pub run_id: u64,

    /// Mirrors the id of the task being executed.
    pub task_id: String,

    /// A snapshot of the task definition at execution time.
    pub task: tasks::Task,

    /// Time the record was created in epoch milliseconds.
    pub created: u64,

    /// Time the container was launched in epoch milliseconds; zero until dispatch.
    pub started: u64,

    /// Time the task execution reached a terminal state in epoch milliseconds.
    pub ended: u64,

    /// The exit code of the container, once it has exited.
    pub exit_code: Option<u8>,

    /// Whether the logs for this execution have passed their retention period.
    pub logs_expired: bool,

    /// Whether the log file has been removed from disk.
    pub logs_removed: bool,

    /// The current state of the task execution within its lifecycle.
    pub state: State,

    /// The final result of the task execution; unknown until it completes.
    pub status: Status,

    /// More details on the task execution's status.
    pub status_reason: Option<StatusReason>,

    /// The composed variable set handed to the container.
    pub variables: Vec<Variable>,
}

impl TaskExecution {
    pub fn new(namespace_id: &str, pipeline_id: &str, run_id: u64, task: tasks::Task) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id,
            task_id: task.id().to_string(),
            task,
            created: epoch_milli(),
            started: 0,
            ended: 0,
            exit_code: None,
            logs_expired: false,
            logs_removed: false,
            state: State::Processing,
            status: Status::Unknown,
            status_reason: None,
            variables: vec![],
        }
    }
}

impl TryFrom<storage::task_executions::TaskExecution> for TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: storage::task_executions::TaskExecution) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

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

        let task = serde_json::from_str(&value.task)
            .context("Could not parse field 'task' from storage value")?;

        let variables = serde_json::from_str(&value.variables)
            .context("Could not parse field 'variables' from storage value")?;

        Ok(TaskExecution {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as u64,
            task_id: value.task_id,
            task,
            created,
            started,
            ended,
            exit_code: value.exit_code.map(|code| code as u8),
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state,
            status,
            status_reason,
            variables,
        })
    }
}

impl TryFrom<TaskExecution> for storage::task_executions::TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: TaskExecution) -> Result<Self> {
        let status_reason = match &value.status_reason {
            Some(reason) => serde_json::to_string(reason)
                .context("Could not serialize field 'status_reason' into storage value")?,
            None => String::new(),
        };

        Ok(Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as i64,
            task_id: value.task_id,
            task: serde_json::to_string(&value.task)
                .context("Could not serialize field 'task' into storage value")?,
            created: value.created.to_string(),
            started: value.started.to_string(),
            ended: value.ended.to_string(),
            exit_code: value.exit_code.map(|code| code as i64),
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason,
            variables: serde_json::to_string(&value.variables)
                .context("Could not serialize field 'variables' into storage value")?,
        })
    }
}

/// The name handed to the scheduler for a task execution's container.
pub fn task_execution_container_id(
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> String {
    format!("gofer_{namespace_id}_{pipeline_id}_{run_id}_{task_id}")
}

/// Where a task execution's log file lives on disk.
pub fn task_execution_log_path(
    dir: &str,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> PathBuf {
    PathBuf::from(format!(
        "{dir}/{namespace_id}_{pipeline_id}_{run_id}_{task_id}.log"
    ))
}

impl Api {
    /// List all task executions for a run.
    pub async fn list_task_executions(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
    ) -> Result<Vec<TaskExecution>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_executions =
            storage::task_executions::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
                .await?;

        let mut executions = vec![];

        for storage_execution in storage_executions {
            executions.push(TaskExecution::try_from(storage_execution)?);
        }

        Ok(executions)
    }

    /// Get a single task execution.
    pub async fn get_task_execution(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
    ) -> Result<TaskExecution, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_execution = storage::task_executions::get(
            &mut conn,
            namespace_id,
            pipeline_id,
            run_id as i64,
            task_id,
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "task execution '{task_id}' does not exist for run '{run_id}'"
            )),
            _ => err.into(),
        })?;

        Ok(TaskExecution::try_from(storage_execution)?)
    }

    /// Cancel a single running task execution. The scheduler stop is the only action taken here;
    /// the run's observer finalizes the record once the container reports in.
    pub async fn cancel_task_execution(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
        force: bool,
    ) -> Result<(), ApiError> {
        let execution = self
            .get_task_execution(namespace_id, pipeline_id, run_id, task_id)
            .await?;

        if execution.state != State::Running {
            return Err(ApiError::FailedPrecondition(format!(
                "task execution '{task_id}' is in state '{}'; only running task executions can be cancelled directly",
                execution.state
            )));
        }

        let timeout = if force {
            0
        } else {
            self.conf.api.task_execution_stop_timeout as i64
        };

        self.event_bus
            .publish(event_utils::Kind::TaskRunCancellationStarted {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id,
                task_id: task_id.into(),
                timeout: timeout as u64,
            })
            .await;

        self.scheduler
            .stop_container(scheduler::StopContainerRequest {
                name: task_execution_container_id(namespace_id, pipeline_id, run_id, task_id),
                timeout,
            })
            .await
            .map_err(|e| ApiError::Unavailable(format!("could not stop container; {e}")))?;

        Ok(())
    }

    /// Stream the log file of a task execution line by line. The stream follows the file until
    /// the EOF marker is observed, so callers can attach while the container is still running.
    pub async fn get_task_execution_logs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<String>, ApiError> {
        let execution = self
            .get_task_execution(namespace_id, pipeline_id, run_id, task_id)
            .await?;

        if execution.logs_expired || execution.logs_removed {
            return Err(ApiError::FailedPrecondition(format!(
                "logs for task execution '{task_id}' have been removed by the retention policy"
            )));
        }

        let path = task_execution_log_path(
            &self.conf.api.task_execution_logs_dir,
            namespace_id,
            pipeline_id,
            run_id,
            task_id,
        );

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            ApiError::NotFound(format!(
                "log file for task execution '{task_id}' could not be opened; {e}"
            ))
        })?;

        let (sender, receiver) = tokio::sync::mpsc::channel(100);

        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(file).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.contains(GOFER_EOF) {
                            return;
                        }

                        if sender.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        // The writer hasn't reached the EOF marker yet; wait for more output.
                        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Could not read task execution log file");
                        return;
                    }
                }
            }
        });

        Ok(receiver)
    }

    /// Remove a task execution's log file from disk and mark the record accordingly.
    pub async fn delete_task_execution_logs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
    ) -> Result<(), ApiError> {
        let execution = self
            .get_task_execution(namespace_id, pipeline_id, run_id, task_id)
            .await?;

        if execution.state != State::Complete {
            return Err(ApiError::FailedPrecondition(format!(
                "logs for task execution '{task_id}' cannot be removed while it is still in progress"
            )));
        }

        let path = task_execution_log_path(
            &self.conf.api.task_execution_logs_dir,
            namespace_id,
            pipeline_id,
            run_id,
            task_id,
        );

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Could not remove task execution log file");
        }

        let mut conn = self.storage.conn().await?;

        storage::task_executions::update(
            &mut conn,
            namespace_id,
            pipeline_id,
            run_id as i64,
            task_id,
            storage::task_executions::UpdatableFields {
                logs_removed: Some(true),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }
}
