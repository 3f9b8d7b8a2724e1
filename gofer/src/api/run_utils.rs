use crate::api::{
    epoch_milli, event_utils, interpolate_vars, parse_interpolation_syntax, pipeline_configs,
    pipelines, runs, secrets, task_executions, tasks, Api, InterpolationKind, Variable,
    VariableSource, GOFER_EOF,
};
use crate::{scheduler, storage};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{atomic, Arc};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

/// How often observers re-query the scheduler while a container is in flight.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Key for the in-flight run registry on [`Api`].
pub fn run_key(namespace_id: &str, pipeline_id: &str, run_id: u64) -> String {
    format!("{namespace_id}_{pipeline_id}_{run_id}")
}

/// Cancellation intent for a single in-flight run. Cancelling never mutates execution state
/// directly; it flips this flag and the shepherd's observers drive every task execution to its
/// terminal state through the normal paths. How hard the stop is (graceful vs kill) is carried
/// by the scheduler stop timeout, not by the intent marker.
#[derive(Debug, Default)]
pub struct RunCancellation {
    cancelled: atomic::AtomicBool,
}

impl RunCancellation {
    pub fn cancel(&self) {
        self.cancelled.store(true, atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }
}

/// The short-lived API token minted for a run when any of its tasks sets `inject_api_token`.
/// The plaintext secret lives only in memory for the duration of the run; storage only ever
/// sees the hash.
#[derive(Debug, Clone)]
pub struct RunToken {
    pub token_id: String,
    pub secret: String,
}

/// The shepherd is a run specific object that guides runs and their task executions through
/// their execution. It's the core construct of the execution model and contains most of the
/// logic of how a run operates.
#[derive(Debug)]
pub struct Shepherd {
    pub api: Arc<Api>,
    pub metadata: pipelines::Metadata,
    pub config: pipeline_configs::Config,
    pub run: runs::Run,

    /// The live view of every task execution in this run. Entries are only mutated after the
    /// matching storage write succeeds, so readiness evaluation always reflects persisted
    /// state.
    pub task_executions: DashMap<String, task_executions::TaskExecution>,

    run_token: Option<RunToken>,
    cancellation: Arc<RunCancellation>,

    /// Signalled every time a sibling task execution completes; waiting tasks suspend on this
    /// rather than busy-poll their parents.
    task_finished: Notify,
}

impl Shepherd {
    pub fn new(
        api: Arc<Api>,
        metadata: pipelines::Metadata,
        config: pipeline_configs::Config,
        run: runs::Run,
        executions: Vec<task_executions::TaskExecution>,
        run_token: Option<RunToken>,
    ) -> Self {
        let cancellation = Arc::new(RunCancellation::default());

        api.in_flight_runs.insert(
            run_key(&metadata.namespace_id, &metadata.pipeline_id, run.run_id),
            cancellation.clone(),
        );

        let task_executions = DashMap::new();
        for execution in executions {
            task_executions.insert(execution.task_id.clone(), execution);
        }

        Self {
            api,
            metadata,
            config,
            run,
            task_executions,
            run_token,
            cancellation,
            task_finished: Notify::new(),
        }
    }

    /// Drives every task execution of the run to a terminal state and then finalizes the run
    /// itself. This is the shepherd's entrypoint and it blocks until the run is complete.
    pub async fn execute_task_tree(self: Arc<Self>) {
        tokio::spawn(self.clone().handle_run_object_expiry());
        tokio::spawn(self.clone().handle_run_log_expiry());

        let mut conn = match self.api.storage.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database while attempting to execute task tree");
                return;
            }
        };

        if let Err(e) = storage::runs::update(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id as i64,
            storage::runs::UpdatableFields {
                state: Some(runs::State::Running.to_string()),
                ..Default::default()
            },
        )
        .await
        {
            error!(
                namespace_id = &self.metadata.namespace_id,
                pipeline_id = &self.metadata.pipeline_id,
                run_id = self.run.run_id,
                error = %e,
                "Could not update run while attempting to execute task tree"
            );
            return;
        }

        drop(conn);

        let mut task_handles = vec![];

        for task in self.config.tasks.values() {
            let handle = tokio::spawn(self.clone().launch_task_execution(task.clone()));
            task_handles.push(handle);
        }

        join_all(task_handles).await;

        self.process_run_finish().await;
    }

    /// When all task executions are finished we tally what the run's final status is. A run is
    /// only successful if every non-skipped task execution was successful; failures always win
    /// over cancellations.
    async fn process_run_finish(&self) {
        let mut failed = 0;
        let mut cancelled = 0;

        for execution in self.task_executions.iter() {
            match execution.value().status {
                task_executions::Status::Failed | task_executions::Status::Unknown => failed += 1,
                task_executions::Status::Cancelled => cancelled += 1,
                task_executions::Status::Successful | task_executions::Status::Skipped => {}
            }
        }

        let (status, reason) = if failed > 0 {
            (
                runs::Status::Failed,
                Some(runs::StatusReason {
                    reason: runs::StatusReasonType::AbnormalExit,
                    description: "One or more task executions failed during execution".into(),
                }),
            )
        } else if cancelled > 0 {
            (
                runs::Status::Cancelled,
                Some(runs::StatusReason {
                    reason: runs::StatusReasonType::Cancelled,
                    description: "One or more task executions were cancelled during execution"
                        .into(),
                }),
            )
        } else {
            (runs::Status::Successful, None)
        };

        if let Err(e) = self.set_run_complete(status, reason).await {
            error!(
                namespace_id = &self.metadata.namespace_id,
                pipeline_id = &self.metadata.pipeline_id,
                run_id = self.run.run_id,
                error = %e,
                "Could not set run complete while attempting to finish run"
            );
        }
    }

    async fn set_run_complete(
        &self,
        status: runs::Status,
        reason: Option<runs::StatusReason>,
    ) -> Result<()> {
        self.api.in_flight_runs.remove(&run_key(
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id,
        ));

        let mut conn = self
            .api
            .storage
            .conn()
            .await
            .context("Could not open connection to database")?;

        let status_reason = reason
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .context("Could not serialize status reason into storage value")?;

        storage::runs::update(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id as i64,
            storage::runs::UpdatableFields {
                ended: Some(epoch_milli().to_string()),
                state: Some(runs::State::Complete.to_string()),
                status: Some(status.to_string()),
                status_reason,
                ..Default::default()
            },
        )
        .await
        .context("Could not update run status in storage")?;

        self.api
            .event_bus
            .publish(event_utils::Kind::RunCompleted {
                namespace_id: self.metadata.namespace_id.clone(),
                pipeline_id: self.metadata.pipeline_id.clone(),
                run_id: self.run.run_id,
                status,
            })
            .await;

        Ok(())
    }

    async fn set_task_execution_state(
        &self,
        task_id: &str,
        state: task_executions::State,
    ) -> Result<()> {
        let mut conn = self
            .api
            .storage
            .conn()
            .await
            .context("Could not open connection to database")?;

        storage::task_executions::update(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id as i64,
            task_id,
            storage::task_executions::UpdatableFields {
                state: Some(state.to_string()),
                ..Default::default()
            },
        )
        .await
        .context("Could not update task execution state in storage")?;

        self.task_executions.alter(task_id, |_, mut execution| {
            execution.state = state.clone();
            execution
        });

        Ok(())
    }

    async fn set_task_execution_complete(
        &self,
        task_id: &str,
        exit_code: Option<u8>,
        status: task_executions::Status,
        reason: Option<task_executions::StatusReason>,
    ) -> Result<()> {
        if !self.task_executions.contains_key(task_id) {
            bail!("Could not find task execution '{task_id}' while attempting to complete it");
        }

        let mut conn = self
            .api
            .storage
            .conn()
            .await
            .context("Could not open connection to database")?;

        let status_reason = reason
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .context("Could not serialize status reason into storage value")?;

        storage::task_executions::update(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id as i64,
            task_id,
            storage::task_executions::UpdatableFields {
                ended: Some(epoch_milli().to_string()),
                exit_code: exit_code.map(|code| code as i64),
                state: Some(task_executions::State::Complete.to_string()),
                status: Some(status.to_string()),
                status_reason,
                ..Default::default()
            },
        )
        .await
        .context("Could not update task execution status in storage")?;

        self.task_executions.alter(task_id, |_, mut execution| {
            execution.state = task_executions::State::Complete;
            execution.status = status.clone();
            execution.ended = epoch_milli();
            execution.exit_code = exit_code;
            execution
        });

        self.api
            .event_bus
            .publish(event_utils::Kind::TaskRunCompleted {
                namespace_id: self.metadata.namespace_id.clone(),
                pipeline_id: self.metadata.pipeline_id.clone(),
                run_id: self.run.run_id,
                task_id: task_id.to_string(),
                status,
            })
            .await;

        // Wake every sibling waiting on dependency evaluation.
        self.task_finished.notify_waiters();

        Ok(())
    }

    /// Check the dependency tree of a task to see if all its parents have finished.
    fn parent_tasks_complete(
        &self,
        dependency_map: &HashMap<String, tasks::RequiredParentStatus>,
    ) -> bool {
        for parent_id in dependency_map.keys() {
            let parent = match self.task_executions.get(parent_id) {
                Some(parent) => parent,
                None => return false,
            };

            if parent.state != task_executions::State::Complete {
                return false;
            }
        }

        true
    }

    /// Check a dependency tree to see if all parent tasks finished in the required states.
    /// A parent that completed in a state that fails its predicate renders the child
    /// permanently unsatisfiable.
    fn task_dependencies_satisfied(
        &self,
        dependency_map: &HashMap<String, tasks::RequiredParentStatus>,
    ) -> Result<()> {
        for (parent_id, required_status) in dependency_map {
            let parent = match self.task_executions.get(parent_id) {
                Some(parent) => parent,
                None => bail!(
                    "Could not find parent '{parent_id}' in the task execution list while \
                     verifying dependency satisfaction"
                ),
            };

            match required_status {
                tasks::RequiredParentStatus::Unknown => {
                    bail!("Found a parent dependency in state 'Unknown'; invalid state")
                }
                tasks::RequiredParentStatus::Any => {
                    if !parent.status.is_concrete_outcome() {
                        bail!(
                            "Parent '{parent_id}' has status '{}'; the 'any' dependency requires \
                             the parent to have run to a successful or failed outcome",
                            parent.status
                        );
                    }
                }
                tasks::RequiredParentStatus::Success => {
                    if parent.status != task_executions::Status::Successful {
                        bail!(
                            "Parent '{parent_id}' has status '{}'; task requires it to be '{}'",
                            parent.status,
                            task_executions::Status::Successful
                        );
                    }
                }
                tasks::RequiredParentStatus::Failure => {
                    if parent.status != task_executions::Status::Failed {
                        bail!(
                            "Parent '{parent_id}' has status '{}'; task requires it to be '{}'",
                            parent.status,
                            task_executions::Status::Failed
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Drives a single task execution from its freshly persisted `processing` record all the way
    /// to a terminal state. Blocks until the task execution has completed.
    async fn launch_task_execution(self: Arc<Self>, task: tasks::Task) {
        let task_id = task.id().to_string();

        macro_rules! finish_with {
            ($exit_code:expr, $status:expr, $reason:expr) => {
                if let Err(e) = self
                    .set_task_execution_complete(&task_id, $exit_code, $status, $reason)
                    .await
                {
                    error!(
                        namespace_id = &self.metadata.namespace_id,
                        pipeline_id = &self.metadata.pipeline_id,
                        run_id = self.run.run_id,
                        task_id = &task_id,
                        error = %e,
                        "Could not mark task execution complete"
                    );
                }
            };
        }

        // Determine the task execution's composed variable set and persist it so operators can
        // inspect exactly what the container will receive. Secret/object references are still
        // raw markers at this point.
        let env_vars = combine_variables(&self.run, &task);

        let env_vars_json = match serde_json::to_string(&env_vars) {
            Ok(env_vars_json) => env_vars_json,
            Err(e) => {
                finish_with!(
                    None,
                    task_executions::Status::Failed,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::Internal,
                        description: format!("Could not serialize the composed variable set; {e}"),
                    })
                );
                return;
            }
        };

        {
            let mut conn = match self.api.storage.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, task_id = &task_id, "Could not establish connection to database");
                    return;
                }
            };

            if let Err(e) = storage::task_executions::update(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                self.run.run_id as i64,
                &task_id,
                storage::task_executions::UpdatableFields {
                    variables: Some(env_vars_json),
                    ..Default::default()
                },
            )
            .await
            {
                error!(error = %e, task_id = &task_id, "Could not update task execution variables");
                return;
            }
        }

        self.task_executions.alter(&task_id, |_, mut execution| {
            execution.variables = env_vars.clone();
            execution
        });

        // The record is persisted; park the task until its parents complete.
        if let Err(e) = self
            .set_task_execution_state(&task_id, task_executions::State::Waiting)
            .await
        {
            error!(error = %e, task_id = &task_id, "Could not transition task execution to waiting");
            return;
        }

        loop {
            if self.cancellation.is_cancelled() {
                finish_with!(
                    None,
                    task_executions::Status::Cancelled,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::Cancelled,
                        description: "The run was cancelled before this task execution launched"
                            .into(),
                    })
                );
                return;
            }

            if self.parent_tasks_complete(task.depends_on()) {
                break;
            }

            // Suspend until a sibling completes; the timeout keeps cancellation responsive even
            // when no sibling ever finishes.
            tokio::select! {
                _ = self.task_finished.notified() => {}
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
        }

        // All parents are complete; decide whether their outcomes satisfy this task's
        // predicates. A failed predicate is permanent, the task can never become ready.
        if let Err(e) = self.task_dependencies_satisfied(task.depends_on()) {
            finish_with!(
                None,
                task_executions::Status::Skipped,
                Some(task_executions::StatusReason {
                    reason: task_executions::StatusReasonType::FailedPrecondition,
                    description: format!("Task could not be run due to unmet dependencies; {e}"),
                })
            );
            return;
        }

        // The task is ready to run. Resolve secret/object references into their plaintext
        // values now and only now; this is also what lets a task consume objects its parents
        // wrote earlier in this very run.
        let env_vars = match interpolate_vars(
            &self.api,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            Some(self.run.run_id),
            &env_vars,
        )
        .await
        {
            Ok(env_vars) => env_vars,
            Err(e) => {
                finish_with!(
                    None,
                    task_executions::Status::Failed,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::FailedPrecondition,
                        description: format!(
                            "Task could not be run due to inability to retrieve interpolated variables; {e:#}"
                        ),
                    })
                );
                return;
            }
        };

        let mut env_map: HashMap<String, String> = env_vars
            .into_iter()
            .map(|variable| (variable.key, variable.value))
            .collect();

        // The run token never touches storage; it is injected straight into the container
        // environment of the tasks that asked for it.
        if task.inject_api_token() {
            if let Some(run_token) = &self.run_token {
                env_map.insert("GOFER_API_TOKEN".into(), run_token.secret.clone());
            }
        }

        let registry_auth = match self.resolve_registry_auth(task.registry_auth()).await {
            Ok(auth) => auth,
            Err(e) => {
                finish_with!(
                    None,
                    task_executions::Status::Failed,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::FailedPrecondition,
                        description: format!(
                            "Task could not be run due to inability to resolve registry auth; {e:#}"
                        ),
                    })
                );
                return;
            }
        };

        let container_name = task_executions::task_execution_container_id(
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id,
            &task_id,
        );

        if let Err(e) = self
            .api
            .scheduler
            .start_container(scheduler::StartContainerRequest {
                name: container_name.clone(),
                image: task.image().to_string(),
                variables: env_map,
                registry_auth,
                always_pull: false,
                enable_networking: false,
                entrypoint: task.entrypoint().cloned(),
                command: task.command().cloned(),
            })
            .await
        {
            finish_with!(
                None,
                task_executions::Status::Failed,
                Some(task_executions::StatusReason {
                    reason: task_executions::StatusReasonType::SchedulerError,
                    description: format!(
                        "Task could not be run due to inability to be scheduled; {e}"
                    ),
                })
            );
            return;
        }

        let started = epoch_milli();

        {
            let mut conn = match self.api.storage.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, task_id = &task_id, "Could not establish connection to database");
                    return;
                }
            };

            if let Err(e) = storage::task_executions::update(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                self.run.run_id as i64,
                &task_id,
                storage::task_executions::UpdatableFields {
                    state: Some(task_executions::State::Running.to_string()),
                    started: Some(started.to_string()),
                    ..Default::default()
                },
            )
            .await
            {
                error!(error = %e, task_id = &task_id, "Could not update task execution while launching task");
                return;
            }
        }

        self.task_executions.alter(&task_id, |_, mut execution| {
            execution.state = task_executions::State::Running;
            execution.started = started;
            execution
        });

        self.api
            .event_bus
            .publish(event_utils::Kind::TaskRunStarted {
                namespace_id: self.metadata.namespace_id.clone(),
                pipeline_id: self.metadata.pipeline_id.clone(),
                run_id: self.run.run_id,
                task_id: task_id.clone(),
            })
            .await;

        let log_clone = self.clone();
        let log_container_name = container_name.clone();
        let log_task_id = task_id.clone();

        tokio::spawn(async move {
            log_clone
                .handle_log_updates(log_container_name, log_task_id)
                .await
        });

        if let Err(e) = self
            .wait_task_execution_finish(&container_name, &task_id, started)
            .await
        {
            error!(
                namespace_id = &self.metadata.namespace_id,
                pipeline_id = &self.metadata.pipeline_id,
                run_id = self.run.run_id,
                task_id = &task_id,
                error = %e,
                "Encountered error while waiting for task execution to finish"
            );
        }
    }

    /// Registry auth passwords support the pipeline secret interpolation syntax.
    async fn resolve_registry_auth(
        &self,
        auth: Option<&tasks::RegistryAuth>,
    ) -> Result<Option<scheduler::RegistryAuth>> {
        let auth = match auth {
            Some(auth) => auth,
            None => return Ok(None),
        };

        let mut pass = auth.pass.clone();

        if let Some((InterpolationKind::PipelineSecret, key)) = parse_interpolation_syntax(&pass) {
            let secret = self
                .api
                .secret_store
                .get(&secrets::pipeline_secret_store_key(
                    &self.metadata.namespace_id,
                    &self.metadata.pipeline_id,
                    &key,
                ))
                .await
                .with_context(|| format!("Could not retrieve pipeline secret '{key}'"))?;

            pass = String::from_utf8_lossy(&secret.0).to_string();
        }

        Ok(Some(scheduler::RegistryAuth {
            user: auth.user.clone(),
            pass,
        }))
    }

    /// Polls the scheduler until the container reaches a terminal state, then finalizes the task
    /// execution. A container the scheduler stops acknowledging for longer than the orphan
    /// timeout is declared lost and failed.
    async fn wait_task_execution_finish(
        &self,
        container_name: &str,
        task_id: &str,
        started: u64,
    ) -> Result<()> {
        let orphan_timeout =
            Duration::from_secs(self.api.conf.api.task_execution_orphan_timeout).as_millis() as u64;

        let mut last_acknowledged = started;

        loop {
            let response = match self
                .api
                .scheduler
                .get_state(scheduler::GetStateRequest {
                    name: container_name.into(),
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    if orphan_timeout > 0 && epoch_milli() - last_acknowledged > orphan_timeout {
                        self.set_task_execution_complete(
                            task_id,
                            None,
                            task_executions::Status::Failed,
                            Some(task_executions::StatusReason {
                                reason: task_executions::StatusReasonType::Orphaned,
                                description: format!(
                                    "The scheduler stopped acknowledging this task execution's \
                                     container and it is presumed lost; last error: {e}"
                                ),
                            }),
                        )
                        .await?;

                        return Ok(());
                    }

                    debug!(
                        container = container_name,
                        error = %e,
                        "Could not query scheduler for task execution state; will retry"
                    );

                    tokio::time::sleep(MONITOR_INTERVAL).await;
                    continue;
                }
            };

            match response.state {
                scheduler::ContainerState::Running
                | scheduler::ContainerState::Paused
                | scheduler::ContainerState::Restarting => {
                    last_acknowledged = epoch_milli();
                    tokio::time::sleep(MONITOR_INTERVAL).await;
                    continue;
                }
                scheduler::ContainerState::Unknown => {
                    if orphan_timeout > 0 && epoch_milli() - last_acknowledged > orphan_timeout {
                        self.set_task_execution_complete(
                            task_id,
                            None,
                            task_executions::Status::Failed,
                            Some(task_executions::StatusReason {
                                reason: task_executions::StatusReasonType::Orphaned,
                                description:
                                    "The scheduler reported no usable state for this task \
                                     execution's container within the orphan timeout"
                                        .into(),
                            }),
                        )
                        .await?;

                        return Ok(());
                    }

                    tokio::time::sleep(MONITOR_INTERVAL).await;
                    continue;
                }
                scheduler::ContainerState::Exited => {
                    match response.exit_code {
                        Some(0) => {
                            self.set_task_execution_complete(
                                task_id,
                                Some(0),
                                task_executions::Status::Successful,
                                None,
                            )
                            .await?;
                        }
                        Some(exit_code) => {
                            // A non-zero exit after a cancellation request is the container
                            // honoring the stop signal, not a failure of its own making.
                            if self.cancellation.is_cancelled() {
                                self.set_task_execution_complete(
                                    task_id,
                                    Some(exit_code),
                                    task_executions::Status::Cancelled,
                                    Some(task_executions::StatusReason {
                                        reason: task_executions::StatusReasonType::Cancelled,
                                        description: "The task execution was cancelled".into(),
                                    }),
                                )
                                .await?;
                            } else {
                                self.set_task_execution_complete(
                                    task_id,
                                    Some(exit_code),
                                    task_executions::Status::Failed,
                                    Some(task_executions::StatusReason {
                                        reason: task_executions::StatusReasonType::AbnormalExit,
                                        description:
                                            "Task execution exited with an abnormal exit code"
                                                .into(),
                                    }),
                                )
                                .await?;
                            }
                        }
                        None => {
                            self.set_task_execution_complete(
                                task_id,
                                None,
                                task_executions::Status::Failed,
                                Some(task_executions::StatusReason {
                                    reason: task_executions::StatusReasonType::AbnormalExit,
                                    description: "Task execution exited without an exit code"
                                        .into(),
                                }),
                            )
                            .await?;
                        }
                    }

                    return Ok(());
                }
            }
        }
    }

    /// Follows the container's log stream and mirrors it into the task execution's log file,
    /// terminated by the EOF marker.
    async fn handle_log_updates(self: Arc<Self>, container_name: String, task_id: String) {
        let log_stream = self.api.scheduler.get_logs(scheduler::GetLogsRequest {
            name: container_name,
        });

        let path = task_executions::task_execution_log_path(
            &self.api.conf.api.task_execution_logs_dir,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            self.run.run_id,
            &task_id,
        );

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, path = %parent.display(), "Could not create task execution log directory");
                return;
            }
        }

        let file = match tokio::fs::File::create(&path).await {
            Ok(file) => Arc::new(Mutex::new(file)),
            Err(e) => {
                error!(
                    error = %e,
                    path = %path.display(),
                    task_id = &task_id,
                    "Failed to open file for writing while attempting to save logs"
                );
                return;
            }
        };

        log_stream
            .for_each(|item| {
                let file = Arc::clone(&file);
                let task_id = task_id.clone();

                async move {
                    let log_object = match item {
                        Ok(log_object) => log_object,
                        Err(e) => {
                            debug!(task_id = &task_id, error = %e, "Log stream from scheduler ended");
                            return;
                        }
                    };

                    let mut file = file.lock().await;

                    match log_object {
                        scheduler::Log::Stdout(log) | scheduler::Log::Stderr(log) => {
                            if let Err(e) = file.write_all(&log).await {
                                error!(task_id = &task_id, error = %e, "Failed to write log line for container");
                            }
                        }
                        scheduler::Log::Unknown => {
                            error!(task_id = &task_id, "Received malformed log from scheduler");
                        }
                    };
                }
            })
            .await;

        let mut file = file.lock().await;

        if let Err(e) = file.write_all(GOFER_EOF.as_bytes()).await {
            error!(task_id = &task_id, error = %e, "Failed to write EOF marker to container log");
        }
    }

    /// Removes run level objects from the object store once this pipeline has accumulated more
    /// runs than the expiry threshold allows.
    async fn handle_run_object_expiry(self: Arc<Self>) {
        let limit = self.api.conf.object_store.run_object_expiry;

        if limit == 0 {
            return;
        }

        let mut conn = match self.api.storage.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database for run object expiry");
                return;
            }
        };

        let runs_list = match storage::runs::list(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            0,
            limit + 1,
        )
        .await
        {
            Ok(runs_list) => runs_list,
            Err(e) => {
                error!(error = %e, "Could not retrieve runs for run object expiry");
                return;
            }
        };

        // If there aren't enough runs to reach the limit there is nothing to remove.
        if limit + 1 > runs_list.len() as u64 {
            return;
        }

        let mut expired_run = match runs_list.last() {
            Some(run) => run.to_owned(),
            None => return,
        };

        // If the expiring run is somehow still in progress we wait for it to be done.
        while expired_run.state != runs::State::Complete.to_string() {
            tokio::time::sleep(Duration::from_secs(1)).await;

            expired_run = match storage::runs::get(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                expired_run.run_id,
            )
            .await
            {
                Ok(run) => run,
                Err(e) => {
                    error!(error = %e, "Could not get run while performing run object expiry");
                    return;
                }
            };
        }

        if expired_run.store_objects_expired {
            return;
        }

        let expired_run_id = expired_run.run_id;

        let objects = match storage::object_store_run_keys::list(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            expired_run_id,
        )
        .await
        {
            Ok(objects) => objects,
            Err(e) => {
                error!(error = %e, "Could not list run objects for expiry");
                return;
            }
        };

        let mut removed_keys = vec![];

        for object in objects {
            if let Err(e) = self
                .api
                .object_store
                .delete(&crate::api::objects::run_object_store_key(
                    &self.metadata.namespace_id,
                    &self.metadata.pipeline_id,
                    expired_run_id as u64,
                    &object.key,
                ))
                .await
            {
                error!(error = %e, key = object.key, "Could not delete run object during expiry");
                continue;
            }

            if let Err(e) = storage::object_store_run_keys::delete(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                expired_run_id,
                &object.key,
            )
            .await
            {
                error!(error = %e, key = object.key, "Could not delete run object key during expiry");
                continue;
            }

            removed_keys.push(object.key);
        }

        if let Err(e) = storage::runs::update(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            expired_run_id,
            storage::runs::UpdatableFields {
                store_objects_expired: Some(true),
                ..Default::default()
            },
        )
        .await
        {
            error!(error = %e, "Could not update run during object expiry");
            return;
        }

        debug!(
            namespace_id = &self.metadata.namespace_id,
            pipeline_id = &self.metadata.pipeline_id,
            run_id = expired_run_id,
            removed_objects = ?removed_keys,
            "Removed old run objects"
        );
    }

    /// Removes the log files of the oldest run past the log retention threshold.
    async fn handle_run_log_expiry(self: Arc<Self>) {
        let limit = self.api.conf.api.task_execution_log_retention;

        if limit == 0 {
            return;
        }

        let mut conn = match self.api.storage.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database for run log expiry");
                return;
            }
        };

        let runs_list = match storage::runs::list(
            &mut conn,
            &self.metadata.namespace_id,
            &self.metadata.pipeline_id,
            0,
            limit + 1,
        )
        .await
        {
            Ok(runs_list) => runs_list,
            Err(e) => {
                error!(error = %e, "Could not retrieve runs for run log expiry");
                return;
            }
        };

        if limit + 1 > runs_list.len() as u64 {
            return;
        }

        let expired_run = match runs_list.last() {
            Some(run) => run.to_owned(),
            None => return,
        };

        // Log files only settle once every task execution has finished writing; wait for the
        // whole set to complete before touching anything.
        let executions = loop {
            let executions = match storage::task_executions::list(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                expired_run.run_id,
            )
            .await
            {
                Ok(executions) => executions,
                Err(e) => {
                    error!(error = %e, "Could not list task executions for run log expiry");
                    return;
                }
            };

            let all_complete = executions.iter().all(|execution| {
                execution.state == task_executions::State::Complete.to_string()
            });

            if all_complete {
                break executions;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        let mut removed_files = vec![];

        for execution in executions {
            if execution.logs_expired || execution.logs_removed {
                continue;
            }

            let log_path = task_executions::task_execution_log_path(
                &self.api.conf.api.task_execution_logs_dir,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                expired_run.run_id as u64,
                &execution.task_id,
            );

            if let Err(e) = tokio::fs::remove_file(&log_path).await {
                debug!(error = %e, path = %log_path.display(), "Could not remove task execution log file");
            }

            if let Err(e) = storage::task_executions::update(
                &mut conn,
                &self.metadata.namespace_id,
                &self.metadata.pipeline_id,
                expired_run.run_id,
                &execution.task_id,
                storage::task_executions::UpdatableFields {
                    logs_expired: Some(true),
                    logs_removed: Some(true),
                    ..Default::default()
                },
            )
            .await
            {
                error!(error = %e, task_id = execution.task_id, "Could not update task execution during log expiry");
                continue;
            }

            removed_files.push(log_path.to_string_lossy().to_string());
        }

        debug!(
            namespace_id = &self.metadata.namespace_id,
            pipeline_id = &self.metadata.pipeline_id,
            run_id = expired_run.run_id,
            removed_files = ?removed_files,
            "Removed old task execution log files"
        );
    }
}

/// We need to combine the environment variables we get from multiple sources in order to pass
/// them finally to the task execution. The order in which they are passed is important as they
/// can and should overwrite each other, even though the intention of prefixing the environment
/// variables is to prevent the chance of overwriting. The order in which they are passed into
/// the extend function determines the priority in reverse order; last in the stack will
/// overwrite any conflicts from the others.
///
/// There are many places a task execution could potentially get env vars from:
/// 1) At the time of run inception, either by the user manually or by an extension.
/// 2) From the pipeline's configuration file.
/// 3) Right before the task execution starts, from Gofer itself.
///
/// The order in which the env vars are stacked are as such:
/// 1) We first pass in the Gofer system specific envvars as these are the most replaceable on
///    the totem pole.
/// 2) We pass in the task specific envvars defined by the user in the pipeline config.
/// 3) Lastly we pass in the run specific defined envvars. These are usually provided by either
///    an extension or the user when they attempt to start a new run manually. Since these are
///    the most likely to be edited adhoc they are treated as the most important.
pub fn combine_variables(run: &runs::Run, task: &tasks::Task) -> Vec<Variable> {
    let system_injected_vars = system_injected_vars(run, task);

    let task_vars: HashMap<String, Variable> = task
        .variables()
        .iter()
        .map(|variable| (variable.key.to_uppercase(), variable.clone()))
        .collect();

    let run_vars: HashMap<String, Variable> = run
        .variables
        .iter()
        .map(|variable| (variable.key.to_uppercase(), variable.clone()))
        .collect();

    let mut task_execution_vars = system_injected_vars;
    task_execution_vars.extend(task_vars);
    task_execution_vars.extend(run_vars);

    // It is possible for the user to enter an empty key, but that would be an error when
    // attempting to pass it to the container.
    task_execution_vars
        .into_iter()
        .filter_map(|(key, value)| if key.is_empty() { None } else { Some(value) })
        .collect()
}

/// On every run Gofer injects vars that are determined by the system. These give the user some
/// basic information they can pull into their program about the details of the run.
fn system_injected_vars(run: &runs::Run, task: &tasks::Task) -> HashMap<String, Variable> {
    HashMap::from([
        (
            "GOFER_PIPELINE_ID".to_string(),
            Variable {
                key: "GOFER_PIPELINE_ID".to_string(),
                value: run.pipeline_id.clone(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_RUN_ID".to_string(),
            Variable {
                key: "GOFER_RUN_ID".to_string(),
                value: run.run_id.to_string(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_TASK_ID".to_string(),
            Variable {
                key: "GOFER_TASK_ID".to_string(),
                value: task.id().to_string(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_TASK_IMAGE".to_string(),
            Variable {
                key: "GOFER_TASK_IMAGE".to_string(),
                value: task.image().to_string(),
                source: VariableSource::System,
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tasks::{RequiredParentStatus, Task, TaskDetails};

    fn test_task(id: &str, variables: Vec<Variable>) -> Task {
        Task::Custom(TaskDetails {
            id: id.into(),
            description: "".into(),
            image: "ubuntu:latest".into(),
            registry_auth: None,
            depends_on: HashMap::new(),
            variables,
            entrypoint: None,
            command: None,
            inject_api_token: false,
        })
    }

    fn test_run(variables: Vec<Variable>) -> runs::Run {
        runs::Run::new(
            "default",
            "simple",
            1,
            runs::Initiator::Human {
                user: "tester".into(),
            },
            variables,
            None,
        )
    }

    #[test]
    fn run_variables_overwrite_config_and_system_variables() {
        let task = test_task(
            "task_one",
            vec![
                Variable {
                    key: "SHARED".into(),
                    value: "from_config".into(),
                    source: VariableSource::PipelineConfig,
                },
                Variable {
                    key: "CONFIG_ONLY".into(),
                    value: "config".into(),
                    source: VariableSource::PipelineConfig,
                },
            ],
        );

        let run = test_run(vec![Variable {
            key: "SHARED".into(),
            value: "from_run".into(),
            source: VariableSource::RunOptions,
        }]);

        let combined = combine_variables(&run, &task);

        let shared = combined.iter().find(|v| v.key == "SHARED").unwrap();
        assert_eq!(shared.value, "from_run");
        assert_eq!(shared.source, VariableSource::RunOptions);

        assert!(combined.iter().any(|v| v.key == "CONFIG_ONLY"));
        assert!(combined.iter().any(|v| v.key == "GOFER_PIPELINE_ID"));
        assert!(combined.iter().any(|v| v.key == "GOFER_RUN_ID"));
    }

    #[test]
    fn empty_variable_keys_are_dropped() {
        let task = test_task(
            "task_one",
            vec![Variable {
                key: "".into(),
                value: "nothing".into(),
                source: VariableSource::PipelineConfig,
            }],
        );

        let run = test_run(vec![]);

        let combined = combine_variables(&run, &task);
        assert!(combined.iter().all(|v| !v.key.is_empty()));
    }
}
