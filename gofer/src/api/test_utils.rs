//! Shared scaffolding for api-level tests: an in-memory scripted scheduler and a fully wired
//! [`Api`] instance backed by throwaway sqlite files.

use crate::api::{namespaces, runs, task_executions, Api};
use crate::{conf, object_store, scheduler, secret_store, storage};
use async_trait::async_trait;
use futures::Stream;
use rand::prelude::*;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted container should behave once launched.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// The container exits immediately with the given code.
    ExitWith(u8),

    /// The container keeps running until it receives a stop, then exits 137.
    RunUntilStopped,

    /// The scheduler refuses to start the container at all.
    FailToStart,
}

#[derive(Debug, Clone)]
struct TestContainer {
    state: scheduler::ContainerState,
    exit_code: Option<u8>,
}

/// A scheduler whose containers are scripts. Behaviors are registered per task id; anything
/// without a script exits successfully right away.
#[derive(Debug, Default)]
pub struct TestScheduler {
    containers: Mutex<HashMap<String, TestContainer>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
}

impl TestScheduler {
    pub fn set_behavior(&self, task_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(task_id.to_string(), behavior);
    }

    fn behavior_for(&self, container_name: &str) -> Behavior {
        let behaviors = self.behaviors.lock().unwrap();

        for (task_id, behavior) in behaviors.iter() {
            if container_name.ends_with(&format!("_{task_id}")) {
                return behavior.clone();
            }
        }

        Behavior::ExitWith(0)
    }
}

#[async_trait]
impl scheduler::Scheduler for TestScheduler {
    async fn start_container(
        &self,
        req: scheduler::StartContainerRequest,
    ) -> Result<scheduler::StartContainerResponse, scheduler::SchedulerError> {
        let container = match self.behavior_for(&req.name) {
            Behavior::FailToStart => {
                return Err(scheduler::SchedulerError::NoSuchImage(format!(
                    "could not pull image '{}'",
                    req.image
                )));
            }
            Behavior::ExitWith(exit_code) => TestContainer {
                state: scheduler::ContainerState::Exited,
                exit_code: Some(exit_code),
            },
            Behavior::RunUntilStopped => TestContainer {
                state: scheduler::ContainerState::Running,
                exit_code: None,
            },
        };

        self.containers
            .lock()
            .unwrap()
            .insert(req.name.clone(), container);

        Ok(scheduler::StartContainerResponse {
            scheduler_id: Some(req.name),
            url: None,
        })
    }

    async fn stop_container(
        &self,
        req: scheduler::StopContainerRequest,
    ) -> Result<(), scheduler::SchedulerError> {
        let mut containers = self.containers.lock().unwrap();

        let container = containers
            .get_mut(&req.name)
            .ok_or_else(|| scheduler::SchedulerError::NoSuchContainer(req.name.clone()))?;

        container.state = scheduler::ContainerState::Exited;
        container.exit_code = Some(137);

        Ok(())
    }

    async fn get_state(
        &self,
        req: scheduler::GetStateRequest,
    ) -> Result<scheduler::GetStateResponse, scheduler::SchedulerError> {
        let containers = self.containers.lock().unwrap();

        let container = containers
            .get(&req.name)
            .ok_or_else(|| scheduler::SchedulerError::NoSuchContainer(req.name.clone()))?;

        Ok(scheduler::GetStateResponse {
            exit_code: container.exit_code,
            state: container.state.clone(),
        })
    }

    fn get_logs(
        &self,
        _req: scheduler::GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<scheduler::Log, scheduler::SchedulerError>> + Send>>
    {
        Box::pin(futures::stream::iter(vec![Ok(scheduler::Log::Stdout(
            bytes::Bytes::from_static(b"test container output\n"),
        ))]))
    }
}

/// A fully wired api instance on top of throwaway files and the scripted scheduler.
pub struct TestHarness {
    pub api: Arc<Api>,
    pub scheduler: Arc<TestScheduler>,
    storage_path: String,
    object_store_path: String,
    secret_store_path: String,
}

impl TestHarness {
    pub async fn new() -> Self {
        let append_num: u32 = rand::thread_rng().gen();

        let storage_path = format!("/tmp/gofer_tests_api_storage{append_num}.db");
        let object_store_path = format!("/tmp/gofer_tests_api_objects{append_num}.db");
        let secret_store_path = format!("/tmp/gofer_tests_api_secrets{append_num}.db");

        let mut config = conf::Configuration::<conf::api::ApiConfig>::load(None).unwrap();
        config.server.storage_path = storage_path.clone();
        config.api.task_execution_logs_dir = format!("/tmp/gofer_tests_api_logs{append_num}");
        config.api.event_prune_interval = 86400;

        let db = storage::Db::new(&storage_path).await.unwrap();

        let object_store = object_store::sqlite::Engine::new(&object_store::sqlite::Config {
            path: object_store_path.clone(),
        })
        .await
        .unwrap();

        let secret_store = secret_store::sqlite::Engine::new(&secret_store::sqlite::Config {
            path: secret_store_path.clone(),
            encryption_key: "mysuperduperdupersupersecretkey_".into(),
        })
        .await
        .unwrap();

        let test_scheduler = Arc::new(TestScheduler::default());

        let api = Api::new(
            config,
            db,
            test_scheduler.clone(),
            Arc::new(object_store),
            Arc::new(secret_store),
        );

        namespaces::create_default_namespace(&api).await.unwrap();

        Self {
            api,
            scheduler: test_scheduler,
            storage_path,
            object_store_path,
            secret_store_path,
        }
    }

    /// Register a config and immediately deploy it so the pipeline is runnable.
    pub async fn register_and_deploy(&self, pipeline: gofer_sdk::config::Pipeline) {
        let config = self
            .api
            .register_config(namespaces::DEFAULT_NAMESPACE_ID, pipeline)
            .await
            .unwrap();

        self.api
            .deploy_pipeline(
                namespaces::DEFAULT_NAMESPACE_ID,
                &config.pipeline_id,
                config.version,
            )
            .await
            .unwrap();
    }

    /// Poll until the run reaches a terminal state or the timeout passes.
    pub async fn wait_run_complete(
        &self,
        pipeline_id: &str,
        run_id: u64,
        timeout: Duration,
    ) -> runs::Run {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let run = self
                .api
                .get_run(namespaces::DEFAULT_NAMESPACE_ID, pipeline_id, run_id)
                .await
                .unwrap();

            if run.state == runs::State::Complete {
                return run;
            }

            if tokio::time::Instant::now() > deadline {
                panic!("run '{run_id}' did not complete within {timeout:?}; last seen: {run:#?}");
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll until the given task execution reaches the wanted state or the timeout passes.
    pub async fn wait_task_state(
        &self,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
        state: task_executions::State,
        timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let execution = self
                .api
                .get_task_execution(namespaces::DEFAULT_NAMESPACE_ID, pipeline_id, run_id, task_id)
                .await
                .unwrap();

            if execution.state == state {
                return;
            }

            if tokio::time::Instant::now() > deadline {
                panic!(
                    "task execution '{task_id}' did not reach state '{state}' within {timeout:?}; \
                     last seen: {execution:#?}"
                );
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for path in [
            &self.storage_path,
            &self.object_store_path,
            &self.secret_store_path,
        ] {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(format!("{path}-shm"));
            let _ = std::fs::remove_file(format!("{path}-wal"));
        }
    }
}
