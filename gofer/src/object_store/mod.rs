pub mod sqlite;

use crate::conf;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different object store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("could not establish connection to object store; {0}")]
    Connection(String),

    #[error("requested object not found")]
    NotFound,

    #[error("object already exists")]
    Exists,

    #[error("could not init store; {0}")]
    FailedInitPrecondition(String),

    #[error("unexpected object store error occurred; {0}")]
    Internal(String),
}

/// A binary blob stored under a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(pub Vec<u8>);

/// The store trait defines what the interface between Gofer and an object store should adhere to.
///
/// Object stores have no ordering guarantees across keys; within a key, a forced put is
/// last-writer-wins.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Value, ObjectStoreError>;

    /// Insert a new object. When force is false an existing key returns
    /// [`ObjectStoreError::Exists`]; when true the value is overwritten.
    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), ObjectStoreError>;

    /// Return every key that starts with the given prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Engine {
    #[default]
    Sqlite,
}

pub async fn init_object_store(
    config: &conf::api::ObjectStore,
) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Sqlite => {
            if let Some(config) = &config.sqlite {
                let engine = sqlite::Engine::new(config).await?;
                Ok(Arc::new(engine))
            } else {
                Err(ObjectStoreError::FailedInitPrecondition(
                    "sqlite engine settings not found in config".into(),
                ))
            }
        }
    }
}
