pub mod docker;

use crate::conf;
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::{collections::HashMap, pin::Pin};
use strum::{Display, EnumString};

/// Represents different scheduler failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// Failed to start scheduler due to misconfigured settings, usually from a misconfigured
    /// settings file.
    #[error("could not init scheduler; {0}")]
    FailedSchedulerPrecondition(String),

    /// Failed to communicate with the scheduler due to a network error or otherwise.
    #[error("could not connect to scheduler; {0}")]
    Connection(String),

    /// Container requested by name could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// Image requested by name could not be found.
    #[error("container image not found; {0}")]
    NoSuchImage(String),

    /// An unexpected error has occurred.
    #[error("unexpected scheduler error occurred; {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Unknown,
    Running,
    Paused,
    Restarting,
    Exited,
}

/// Private repositories sometimes require authentication.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug)]
pub struct StartContainerRequest {
    /// A unique identifier to identify the container with.
    pub name: String,

    /// The container image repository and image name; tag can be included.
    pub image: String,

    /// Environment variables to be passed to the container.
    pub variables: HashMap<String, String>,

    /// Registry authentication details.
    pub registry_auth: Option<RegistryAuth>,

    /// Attempt to pull the container from the upstream repository even if it exists already
    /// locally. This is useful if your containers don't use proper tagging or versioning.
    pub always_pull: bool,

    /// Only needed by extensions; spin the container up with networking enabled, so that Gofer
    /// can connect to it.
    pub enable_networking: bool,

    /// Replaces the container's entrypoint with a custom one.
    pub entrypoint: Option<Vec<String>>,

    /// Replaces the container's cmd instruction with a custom one.
    pub command: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct StartContainerResponse {
    /// An optional, unique way for the scheduler to identify the container. Sometimes the
    /// scheduler will not be able to use the client provided container name as a unique
    /// identifier and will return its own.
    pub scheduler_id: Option<String>,

    /// An endpoint that is only returned for containers that have networking turned on.
    pub url: Option<String>,
}

#[derive(Debug)]
pub struct StopContainerRequest {
    /// A unique identifier to identify the container with.
    pub name: String,

    /// The total time in seconds the scheduler should wait for a graceful stop before issuing a
    /// SIGKILL. A timeout of 0 kills immediately.
    pub timeout: i64,
}

#[derive(Debug)]
pub struct GetStateRequest {
    /// Unique identifier for the container.
    pub name: String,
}

#[derive(Debug)]
pub struct GetStateResponse {
    /// In the event that the container is in an "exited" state; the exit code of that container.
    pub exit_code: Option<u8>,

    /// The current state of the container.
    pub state: ContainerState,
}

#[derive(Debug)]
pub struct GetLogsRequest {
    /// Unique identifier for the container.
    pub name: String,
}

/// Represents a single log line/entry from a particular container.
#[derive(Debug)]
pub enum Log {
    Unknown,
    Stdout(bytes::Bytes),
    Stderr(bytes::Bytes),
}

/// The scheduler trait defines what the interface between Gofer and a container scheduler should
/// look like.
#[async_trait]
pub trait Scheduler: Debug + Send + Sync {
    /// Start a container based on details passed; implementations pull the image and perform
    /// registry auth when necessary.
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError>;

    /// Stop a container with an associated timeout; containers that do not respond to a graceful
    /// shutdown within the timeout are killed.
    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), SchedulerError>;

    /// Get the current state of a container and its potential exit code.
    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError>;

    /// Returns a stream of logs from the container.
    fn get_logs(
        &self,
        req: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Engine {
    #[default]
    Docker,
}

pub async fn init_scheduler(
    config: &conf::api::Scheduler,
) -> Result<Arc<dyn Scheduler>, SchedulerError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Docker => {
            if let Some(config) = &config.docker {
                let engine = docker::Docker::new(config).await?;
                Ok(Arc::new(engine))
            } else {
                Err(SchedulerError::FailedSchedulerPrecondition(
                    "docker engine settings not found in config".into(),
                ))
            }
        }
    }
}
