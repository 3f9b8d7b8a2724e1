pub mod sqlite;

use crate::conf;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different secret store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("could not establish connection to secret store; {0}")]
    Connection(String),

    #[error("requested secret not found")]
    NotFound,

    #[error("secret already exists")]
    Exists,

    #[error("could not init store; {0}")]
    FailedInitPrecondition(String),

    #[error("could not encrypt/decrypt secret; {0}")]
    FailedEncryption(String),

    #[error("unexpected secret store error occurred; {0}")]
    Internal(String),
}

/// A plaintext secret value. Only ever materialized internally during variable injection; the
/// API surface returns secret metadata exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(pub Vec<u8>);

/// The store trait defines what the interface between Gofer and a secret store should adhere to.
#[async_trait]
pub trait SecretStore: Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Value, SecretStoreError>;

    /// Insert a new secret. When force is false an existing key returns
    /// [`SecretStoreError::Exists`]; when true the value is overwritten.
    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError>;

    /// Return every key that starts with the given prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SecretStoreError>;

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Engine {
    #[default]
    Sqlite,
}

pub async fn init_secret_store(
    config: &conf::api::SecretStore,
) -> Result<Arc<dyn SecretStore>, SecretStoreError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Sqlite => {
            if let Some(config) = &config.sqlite {
                let engine = sqlite::Engine::new(config).await?;
                Ok(Arc::new(engine))
            } else {
                Err(SecretStoreError::FailedInitPrecondition(
                    "sqlite engine settings not found in config".into(),
                ))
            }
        }
    }
}
