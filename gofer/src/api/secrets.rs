use crate::api::{epoch_milli, permissioning, Api, ApiError};
use crate::{secret_store, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The address of a global secret within the secret store. The prefix keeps operator-level
/// secrets from ever colliding with pipeline secrets.
pub fn global_secret_store_key(key: &str) -> String {
    format!("global_secret_{key}")
}

/// The address of a pipeline secret within the secret store.
pub fn pipeline_secret_store_key(namespace_id: &str, pipeline_id: &str, key: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_{key}")
}

/// Metadata about a stored secret. Secret values are write-only through the API; the plaintext
/// is read internally during variable injection and nowhere else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    /// The user supplied key for the secret.
    pub key: String,

    /// For global secrets, which namespaces may use this secret. Entries are either exact
    /// namespace ids or regexes matched against namespace ids. Pipeline secrets leave this
    /// empty; they are scoped by their location instead.
    pub namespaces: Vec<String>,

    /// Time the secret was stored in epoch milliseconds.
    pub created: u64,
}

impl Secret {
    /// Checks the secret's namespace filter list to confirm it can be used from the given
    /// namespace.
    pub fn is_allowed_namespace(&self, namespace_id: &str) -> bool {
        permissioning::is_allowed_namespace(&self.namespaces, namespace_id)
    }
}

impl TryFrom<storage::secret_store_global_keys::SecretStoreGlobalKey> for Secret {
    type Error = anyhow::Error;

    fn try_from(value: storage::secret_store_global_keys::SecretStoreGlobalKey) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let namespaces = serde_json::from_str(&value.namespaces)
            .context("Could not parse field 'namespaces' from storage value")?;

        Ok(Secret {
            key: value.key,
            namespaces,
            created,
        })
    }
}

impl TryFrom<storage::secret_store_pipeline_keys::SecretStorePipelineKey> for Secret {
    type Error = anyhow::Error;

    fn try_from(value: storage::secret_store_pipeline_keys::SecretStorePipelineKey) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        Ok(Secret {
            key: value.key,
            namespaces: vec![],
            created,
        })
    }
}

impl Api {
    /// List metadata for all global secrets. Management access only.
    pub async fn list_global_secrets(&self) -> Result<Vec<Secret>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_keys = storage::secret_store_global_keys::list(&mut conn).await?;

        let mut secrets = vec![];

        for storage_key in storage_keys {
            secrets.push(Secret::try_from(storage_key)?);
        }

        Ok(secrets)
    }

    /// Get a single global secret's metadata. Management access only.
    pub async fn get_global_secret(&self, key: &str) -> Result<Secret, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_key = storage::secret_store_global_keys::get(&mut conn, key)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("global secret '{key}' does not exist"))
                }
                _ => err.into(),
            })?;

        Ok(Secret::try_from(storage_key)?)
    }

    /// Store a global secret, usable from any namespace its filter list allows. Management
    /// access only.
    pub async fn put_global_secret(
        &self,
        key: &str,
        content: Vec<u8>,
        namespaces: Vec<String>,
        force: bool,
    ) -> Result<Secret, ApiError> {
        let mut conn = self.storage.conn().await?;

        let secret = Secret {
            key: key.into(),
            namespaces,
            created: epoch_milli(),
        };

        let namespaces_json = serde_json::to_string(&secret.namespaces)
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let insert_result = storage::secret_store_global_keys::insert(
            &mut conn,
            &storage::secret_store_global_keys::SecretStoreGlobalKey {
                key: key.into(),
                namespaces: namespaces_json.clone(),
                created: secret.created.to_string(),
            },
        )
        .await;

        match insert_result {
            Ok(()) => {}
            Err(storage::StorageError::Exists) if force => {
                storage::secret_store_global_keys::update_namespaces(
                    &mut conn,
                    key,
                    &namespaces_json,
                )
                .await?;
            }
            Err(storage::StorageError::Exists) => {
                return Err(ApiError::Exists(format!(
                    "global secret '{key}' already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        self.secret_store
            .put(&global_secret_store_key(key), content, force)
            .await
            .map_err(|err| match err {
                secret_store::SecretStoreError::Exists => {
                    ApiError::Exists(format!("global secret '{key}' already exists"))
                }
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(secret)
    }

    /// Remove a global secret. Management access only.
    pub async fn delete_global_secret(&self, key: &str) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::secret_store_global_keys::delete(&mut conn, key)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("global secret '{key}' does not exist"))
                }
                _ => err.into(),
            })?;

        self.secret_store
            .delete(&global_secret_store_key(key))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(())
    }

    /// List metadata for all of a pipeline's secrets.
    pub async fn list_pipeline_secrets(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<Vec<Secret>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_keys =
            storage::secret_store_pipeline_keys::list(&mut conn, namespace_id, pipeline_id)
                .await?;

        let mut secrets = vec![];

        for storage_key in storage_keys {
            secrets.push(Secret::try_from(storage_key)?);
        }

        Ok(secrets)
    }

    /// Get a single pipeline secret's metadata.
    pub async fn get_pipeline_secret(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
    ) -> Result<Secret, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_key =
            storage::secret_store_pipeline_keys::get(&mut conn, namespace_id, pipeline_id, key)
                .await
                .map_err(|err| match err {
                    storage::StorageError::NotFound => ApiError::NotFound(format!(
                        "secret '{key}' does not exist for pipeline '{pipeline_id}'"
                    )),
                    _ => err.into(),
                })?;

        Ok(Secret::try_from(storage_key)?)
    }

    /// Store a pipeline secret. The value is referenced from task variables via the
    /// `pipeline_secret{{key}}` interpolation syntax and resolved only at dispatch.
    pub async fn put_pipeline_secret(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
        content: Vec<u8>,
        force: bool,
    ) -> Result<Secret, ApiError> {
        let mut conn = self.storage.conn().await?;

        let secret = Secret {
            key: key.into(),
            namespaces: vec![],
            created: epoch_milli(),
        };

        let insert_result = storage::secret_store_pipeline_keys::insert(
            &mut conn,
            &storage::secret_store_pipeline_keys::SecretStorePipelineKey {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                key: key.into(),
                created: secret.created.to_string(),
            },
        )
        .await;

        match insert_result {
            Ok(()) => {}
            Err(storage::StorageError::Exists) if force => {}
            Err(storage::StorageError::Exists) => {
                return Err(ApiError::Exists(format!(
                    "secret '{key}' already exists for pipeline '{pipeline_id}'"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        self.secret_store
            .put(
                &pipeline_secret_store_key(namespace_id, pipeline_id, key),
                content,
                force,
            )
            .await
            .map_err(|err| match err {
                secret_store::SecretStoreError::Exists => ApiError::Exists(format!(
                    "secret '{key}' already exists for pipeline '{pipeline_id}'"
                )),
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(secret)
    }

    /// Remove a pipeline secret.
    pub async fn delete_pipeline_secret(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::secret_store_pipeline_keys::delete(&mut conn, namespace_id, pipeline_id, key)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => ApiError::NotFound(format!(
                    "secret '{key}' does not exist for pipeline '{pipeline_id}'"
                )),
                _ => err.into(),
            })?;

        self.secret_store
            .delete(&pipeline_secret_store_key(namespace_id, pipeline_id, key))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["default"], "default", true)]
    #[case(&["^dev.*"], "devops", true)]
    #[case(&["^dev.*"], "production", false)]
    #[case(&[], "default", false)]
    fn secret_namespace_filters(
        #[case] filters: &[&str],
        #[case] namespace: &str,
        #[case] expected: bool,
    ) {
        let secret = Secret {
            key: "some_key".into(),
            namespaces: filters.iter().map(|f| f.to_string()).collect(),
            created: 0,
        };

        assert_eq!(secret.is_allowed_namespace(namespace), expected);
    }
}
