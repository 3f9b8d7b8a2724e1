use crate::api::{epoch_milli, Api, ApiError};
use crate::{object_store, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The address of a pipeline level object within the object store.
pub fn pipeline_object_store_key(namespace_id: &str, pipeline_id: &str, key: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_{key}")
}

/// The address of a run level object within the object store.
pub fn run_object_store_key(
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    key: &str,
) -> String {
    format!("{namespace_id}_{pipeline_id}_{run_id}_{key}")
}

/// Metadata about a single stored object. The blob itself lives in the object store and is only
/// returned by the explicit get operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Object {
    /// The user supplied key for the object.
    pub key: String,

    /// Time the object was stored in epoch milliseconds.
    pub created: u64,
}

impl TryFrom<storage::object_store_pipeline_keys::ObjectStorePipelineKey> for Object {
    type Error = anyhow::Error;

    fn try_from(value: storage::object_store_pipeline_keys::ObjectStorePipelineKey) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        Ok(Object {
            key: value.key,
            created,
        })
    }
}

impl TryFrom<storage::object_store_run_keys::ObjectStoreRunKey> for Object {
    type Error = anyhow::Error;

    fn try_from(value: storage::object_store_run_keys::ObjectStoreRunKey) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        Ok(Object {
            key: value.key,
            created,
        })
    }
}

impl Api {
    /// List the keys of all objects stored at the pipeline level, oldest first.
    pub async fn list_pipeline_objects(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<Vec<Object>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_keys =
            storage::object_store_pipeline_keys::list(&mut conn, namespace_id, pipeline_id)
                .await?;

        let mut objects = vec![];

        for storage_key in storage_keys {
            objects.push(Object::try_from(storage_key)?);
        }

        Ok(objects)
    }

    /// Retrieve a pipeline level object's content.
    pub async fn get_pipeline_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let value = self
            .object_store
            .get(&pipeline_object_store_key(namespace_id, pipeline_id, key))
            .await
            .map_err(|err| match err {
                object_store::ObjectStoreError::NotFound => ApiError::NotFound(format!(
                    "object '{key}' does not exist for pipeline '{pipeline_id}'"
                )),
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(value.0)
    }

    /// Store an object at the pipeline level.
    ///
    /// Pipeline objects never expire but are limited in number; once a pipeline crosses the
    /// configured object limit the oldest object is evicted, ring buffer style. Returns the key
    /// that was evicted, if any.
    pub async fn put_pipeline_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
        content: Vec<u8>,
        force: bool,
    ) -> Result<Option<String>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let existing_keys =
            storage::object_store_pipeline_keys::list(&mut conn, namespace_id, pipeline_id)
                .await?;

        let mut evicted = None;

        let limit = self.conf.object_store.pipeline_object_limit as usize;

        let already_present = existing_keys.iter().any(|existing| existing.key == key);

        if !already_present && limit > 0 && existing_keys.len() >= limit {
            // The oldest key falls off to make room.
            let oldest = existing_keys.first().unwrap();

            self.object_store
                .delete(&pipeline_object_store_key(
                    namespace_id,
                    pipeline_id,
                    &oldest.key,
                ))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            storage::object_store_pipeline_keys::delete(
                &mut conn,
                namespace_id,
                pipeline_id,
                &oldest.key,
            )
            .await?;

            debug!(
                namespace_id = namespace_id,
                pipeline_id = pipeline_id,
                evicted_key = oldest.key,
                "Pipeline object limit reached; evicted oldest object"
            );

            evicted = Some(oldest.key.clone());
        }

        if !already_present {
            storage::object_store_pipeline_keys::insert(
                &mut conn,
                &storage::object_store_pipeline_keys::ObjectStorePipelineKey {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.into(),
                    key: key.into(),
                    created: epoch_milli().to_string(),
                },
            )
            .await?;
        } else if !force {
            return Err(ApiError::Exists(format!(
                "object '{key}' already exists for pipeline '{pipeline_id}'"
            )));
        }

        self.object_store
            .put(
                &pipeline_object_store_key(namespace_id, pipeline_id, key),
                content,
                force,
            )
            .await
            .map_err(|err| match err {
                object_store::ObjectStoreError::Exists => ApiError::Exists(format!(
                    "object '{key}' already exists for pipeline '{pipeline_id}'"
                )),
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(evicted)
    }

    /// Remove a pipeline level object.
    pub async fn delete_pipeline_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        key: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::object_store_pipeline_keys::delete(&mut conn, namespace_id, pipeline_id, key)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => ApiError::NotFound(format!(
                    "object '{key}' does not exist for pipeline '{pipeline_id}'"
                )),
                _ => err.into(),
            })?;

        self.object_store
            .delete(&pipeline_object_store_key(namespace_id, pipeline_id, key))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(())
    }

    /// List the keys of all objects stored for a single run.
    pub async fn list_run_objects(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
    ) -> Result<Vec<Object>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_keys = storage::object_store_run_keys::list(
            &mut conn,
            namespace_id,
            pipeline_id,
            run_id as i64,
        )
        .await?;

        let mut objects = vec![];

        for storage_key in storage_keys {
            objects.push(Object::try_from(storage_key)?);
        }

        Ok(objects)
    }

    /// Retrieve a run level object's content.
    pub async fn get_run_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        key: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let value = self
            .object_store
            .get(&run_object_store_key(namespace_id, pipeline_id, run_id, key))
            .await
            .map_err(|err| match err {
                object_store::ObjectStoreError::NotFound => ApiError::NotFound(format!(
                    "object '{key}' does not exist for run '{run_id}'"
                )),
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(value.0)
    }

    /// Store an object at the run level. Run objects are unlimited in number but expire
    /// together with their run once it passes the retention window.
    pub async fn put_run_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        key: &str,
        content: Vec<u8>,
        force: bool,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        let insert_result = storage::object_store_run_keys::insert(
            &mut conn,
            &storage::object_store_run_keys::ObjectStoreRunKey {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id: run_id as i64,
                key: key.into(),
                created: epoch_milli().to_string(),
            },
        )
        .await;

        match insert_result {
            Ok(()) => {}
            Err(storage::StorageError::Exists) if force => {}
            Err(storage::StorageError::Exists) => {
                return Err(ApiError::Exists(format!(
                    "object '{key}' already exists for run '{run_id}'"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        self.object_store
            .put(
                &run_object_store_key(namespace_id, pipeline_id, run_id, key),
                content,
                force,
            )
            .await
            .map_err(|err| match err {
                object_store::ObjectStoreError::Exists => ApiError::Exists(format!(
                    "object '{key}' already exists for run '{run_id}'"
                )),
                _ => ApiError::Internal(err.to_string()),
            })?;

        Ok(())
    }

    /// Remove a run level object.
    pub async fn delete_run_object(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        key: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::object_store_run_keys::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            run_id as i64,
            key,
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "object '{key}' does not exist for run '{run_id}'"
            )),
            _ => err.into(),
        })?;

        self.object_store
            .delete(&run_object_store_key(namespace_id, pipeline_id, run_id, key))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(())
    }
}
