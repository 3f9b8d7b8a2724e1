use crate::api::{epoch_milli, event_utils, is_valid_identifier, Api, ApiError};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// The namespace every fresh install starts with and the fallback for clients that don't specify
/// one.
pub const DEFAULT_NAMESPACE_ID: &str = "default";

/// A namespace represents a grouping of pipelines. Normally it is used to divide teams or
/// logically different sections of workloads. It is the highest level unit as it sits above
/// pipelines in the hierarchy of Gofer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    /// Unique identifier for the namespace.
    pub id: String,

    /// Humanized name for the namespace.
    pub name: String,

    /// Short description about what the namespace is used for.
    pub description: String,

    /// Time in epoch milliseconds when namespace was created.
    pub created: u64,

    /// Time in epoch milliseconds when namespace was last modified.
    pub modified: u64,
}

impl Namespace {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Namespace {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            created: epoch_milli(),
            modified: 0,
        }
    }
}

impl TryFrom<storage::namespaces::Namespace> for Namespace {
    type Error = anyhow::Error;

    fn try_from(value: storage::namespaces::Namespace) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        Ok(Namespace {
            id: value.id,
            name: value.name,
            description: value.description,
            created,
            modified,
        })
    }
}

impl From<Namespace> for storage::namespaces::Namespace {
    fn from(value: Namespace) -> Self {
        Self {
            id: value.id,
            name: value.name,
            description: value.description,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNamespaceRequest {
    /// Humanized name for the namespace.
    pub name: Option<String>,

    /// Short description about what the namespace is used for.
    pub description: Option<String>,
}

impl Api {
    /// List all namespaces.
    pub async fn list_namespaces(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Namespace>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_namespaces = storage::namespaces::list(&mut conn, offset, limit).await?;

        let mut namespaces = vec![];

        for storage_namespace in storage_namespaces {
            namespaces.push(Namespace::try_from(storage_namespace)?);
        }

        Ok(namespaces)
    }

    /// Get a namespace by id.
    pub async fn get_namespace(&self, id: &str) -> Result<Namespace, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_namespace = storage::namespaces::get(&mut conn, id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("namespace '{id}' does not exist"))
                }
                _ => err.into(),
            })?;

        Ok(Namespace::try_from(storage_namespace)?)
    }

    /// Create a new namespace. Management access only.
    pub async fn create_namespace(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Namespace, ApiError> {
        is_valid_identifier(id)?;

        let mut conn = self.storage.conn().await?;

        let new_namespace = Namespace::new(id, name, description);

        storage::namespaces::insert(&mut conn, &new_namespace.clone().into())
            .await
            .map_err(|err| match err {
                storage::StorageError::Exists => {
                    ApiError::Exists(format!("namespace '{id}' already exists"))
                }
                _ => err.into(),
            })?;

        self.event_bus
            .publish(event_utils::Kind::NamespaceCreated {
                namespace_id: new_namespace.id.clone(),
            })
            .await;

        Ok(new_namespace)
    }

    /// Update a namespace's details. Management access only.
    pub async fn update_namespace(
        &self,
        id: &str,
        request: UpdateNamespaceRequest,
    ) -> Result<Namespace, ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::namespaces::update(
            &mut conn,
            id,
            storage::namespaces::UpdatableFields {
                name: request.name,
                description: request.description,
                modified: epoch_milli().to_string(),
            },
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => {
                ApiError::NotFound(format!("namespace '{id}' does not exist"))
            }
            _ => err.into(),
        })?;

        let storage_namespace = storage::namespaces::get(&mut conn, id).await?;

        Ok(Namespace::try_from(storage_namespace)?)
    }

    /// Delete a namespace by id. Management access only.
    ///
    /// A namespace that still contains pipelines cannot be removed; callers delete or migrate
    /// the pipelines first.
    pub async fn delete_namespace(&self, id: &str) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        let pipelines = storage::pipeline_metadata::list(&mut conn, id, 0, 1).await?;

        if !pipelines.is_empty() {
            return Err(ApiError::FailedPrecondition(format!(
                "namespace '{id}' still contains pipelines; remove all pipelines before deleting the namespace"
            )));
        }

        storage::namespaces::delete(&mut conn, id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("namespace '{id}' does not exist"))
                }
                _ => err.into(),
            })?;

        self.event_bus
            .publish(event_utils::Kind::NamespaceDeleted {
                namespace_id: id.into(),
            })
            .await;

        Ok(())
    }
}

/// Creates the default namespace for Gofer. It is safe to call this even if the namespace has
/// already been created.
pub async fn create_default_namespace(api: &Api) -> Result<()> {
    let default_namespace = Namespace::new(
        DEFAULT_NAMESPACE_ID,
        "Default",
        "The original namespace created automatically by the Gofer system.",
    );

    let mut conn = api
        .storage
        .conn()
        .await
        .context("Could not open connection to database")?;

    if let Err(e) = storage::namespaces::insert(&mut conn, &default_namespace.clone().into()).await
    {
        match e {
            storage::StorageError::Exists => {
                return Ok(());
            }
            _ => {
                error!(error = %e, "Could not create default namespace");
                anyhow::bail!("{e}")
            }
        }
    }

    api.event_bus
        .publish(event_utils::Kind::NamespaceCreated {
            namespace_id: default_namespace.id,
        })
        .await;

    Ok(())
}
