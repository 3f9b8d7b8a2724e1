use crate::api::{
    epoch_milli, event_utils, external, is_valid_identifier, tasks, tokens, Api, ApiError,
    Variable, VariableSource,
};
use crate::{scheduler, storage};
use anyhow::{anyhow, Context, Result};
use gofer_sdk::extension::api::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{debug, error, info};

/// The address extensions are told to bind to inside their container. The scheduler maps it to
/// an ephemeral host port which is what the main process actually dials.
const EXTENSION_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// How long extension tokens live. Extensions are long-running system components; their tokens
/// are rotated on every restart rather than by expiry.
const EXTENSION_TOKEN_EXPIRY: u64 = 60 * 60 * 24 * 365;

/// How many times we poll a freshly started extension for a healthy Info response before
/// declaring the start failed.
const EXTENSION_STARTUP_ATTEMPTS: u64 = 30;

fn extension_container_id(extension_id: &str) -> String {
    format!("extension_{extension_id}")
}

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    /// Installed and able to be used by pipelines.
    Enabled,

    /// Not available to be used by pipelines; disabled by an admin or uninstalled.
    Disabled,
}

/// The persisted record of an installed extension: everything needed to start it again on boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    /// Unique identifier for the extension.
    pub extension_id: String,

    /// Which container image this extension runs.
    pub image: String,

    /// Auth credentials for the image's registry.
    pub registry_auth: Option<tasks::RegistryAuth>,

    /// Environment variables passed to the extension container on start. Refer to the
    /// extension's documentation for valid settings.
    pub settings: Vec<Variable>,

    /// Time of registration creation in epoch milliseconds.
    pub created: u64,

    /// Time of last modification in epoch milliseconds.
    pub modified: u64,

    /// Whether the extension is available for use by pipelines.
    pub status: Status,

    /// The id of the API token handed to the extension so it can call back into Gofer. Rotated
    /// on every extension start.
    #[serde(skip)]
    pub key_id: String,
}

impl TryFrom<storage::extension_registrations::ExtensionRegistration> for Registration {
    type Error = anyhow::Error;

    fn try_from(value: storage::extension_registrations::ExtensionRegistration) -> Result<Self> {
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

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let registry_auth = serde_json::from_str(&value.registry_auth)
            .context("Could not parse field 'registry_auth' from storage value")?;

        let settings = serde_json::from_str(&value.settings)
            .context("Could not parse field 'settings' from storage value")?;

        Ok(Registration {
            extension_id: value.extension_id,
            image: value.image,
            registry_auth,
            settings,
            created,
            modified,
            status,
            key_id: value.key_id,
        })
    }
}

impl TryFrom<Registration> for storage::extension_registrations::ExtensionRegistration {
    type Error = anyhow::Error;

    fn try_from(value: Registration) -> Result<Self> {
        Ok(Self {
            extension_id: value.extension_id,
            image: value.image,
            registry_auth: serde_json::to_string(&value.registry_auth)
                .context("Could not serialize field 'registry_auth' into storage value")?,
            settings: serde_json::to_string(&value.settings)
                .context("Could not serialize field 'settings' into storage value")?,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
            status: value.status.to_string(),
            key_id: value.key_id,
        })
    }
}

/// A currently running extension as cached in memory: its registration plus the coordinates of
/// the live process.
#[derive(Debug, Clone)]
pub struct Extension {
    pub registration: Registration,

    /// The host-reachable url of the extension's server.
    pub url: String,

    /// The bearer key the extension requires on every call; also the plaintext of the token we
    /// minted for it to call us back.
    pub secret: String,
}

impl Api {
    /// Grab a ready client for a running extension.
    pub fn extension_client(&self, extension_id: &str) -> Result<Client, ApiError> {
        let extension = self.extensions.get(extension_id).ok_or_else(|| {
            ApiError::Unavailable(format!(
                "extension '{extension_id}' is not currently running"
            ))
        })?;

        Client::new(
            &extension.url,
            &extension.secret,
            self.conf.extensions.verify_certs,
        )
        .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// List all installed extensions.
    pub async fn list_extensions(&self) -> Result<Vec<Registration>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_registrations =
            storage::extension_registrations::list(&mut conn, 0, 0).await?;

        let mut registrations = vec![];

        for storage_registration in storage_registrations {
            registrations.push(Registration::try_from(storage_registration)?);
        }

        Ok(registrations)
    }

    /// Get a single extension's registration.
    pub async fn get_extension(&self, extension_id: &str) -> Result<Registration, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_registration = storage::extension_registrations::get(&mut conn, extension_id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("extension '{extension_id}' does not exist"))
                }
                _ => err.into(),
            })?;

        Ok(Registration::try_from(storage_registration)?)
    }

    /// Install a new extension: persist its registration, launch the container, and wait for a
    /// healthy Info response. Management access only.
    pub async fn install_extension(
        self: &Arc<Self>,
        extension_id: &str,
        image: &str,
        registry_auth: Option<tasks::RegistryAuth>,
        settings: HashMap<String, String>,
    ) -> Result<Registration, ApiError> {
        is_valid_identifier(extension_id)?;

        let registration = Registration {
            extension_id: extension_id.into(),
            image: image.into(),
            registry_auth,
            settings: settings
                .into_iter()
                .map(|(key, value)| Variable {
                    key,
                    value,
                    source: VariableSource::System,
                })
                .collect(),
            created: epoch_milli(),
            modified: 0,
            status: Status::Enabled,
            key_id: String::new(),
        };

        let mut conn = self.storage.conn().await?;

        let storage_registration = registration
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?;

        storage::extension_registrations::insert(&mut conn, &storage_registration)
            .await
            .map_err(|err| match err {
                storage::StorageError::Exists => ApiError::Exists(format!(
                    "extension '{extension_id}' is already installed"
                )),
                _ => err.into(),
            })?;

        drop(conn);

        start_extension(self.clone(), registration.clone())
            .await
            .map_err(|e| {
                ApiError::Unavailable(format!(
                    "extension '{extension_id}' was registered but could not be started; {e:#}"
                ))
            })?;

        self.event_bus
            .publish(event_utils::Kind::ExtensionInstalled {
                extension_id: extension_id.into(),
                image: image.into(),
            })
            .await;

        Ok(registration)
    }

    /// Uninstall an extension: the registration is disabled, the process is forcibly stopped,
    /// and every subscription routed to it is marked errored. Management access only.
    pub async fn uninstall_extension(&self, extension_id: &str) -> Result<(), ApiError> {
        let registration = self.get_extension(extension_id).await?;

        // Give the extension a chance to release any external resources before it is stopped.
        if let Ok(client) = self.extension_client(extension_id) {
            if let Err(e) = client.uninstall().await {
                debug!(extension_id = extension_id, error = %e, "Could not deliver uninstall to extension");
            }
        }

        self.extensions.remove(extension_id);

        if let Err(e) = self
            .scheduler
            .stop_container(scheduler::StopContainerRequest {
                name: extension_container_id(extension_id),
                timeout: 0,
            })
            .await
        {
            debug!(extension_id = extension_id, error = %e, "Could not stop extension container during uninstall");
        }

        let mut conn = self.storage.conn().await?;

        storage::extension_registrations::update(
            &mut conn,
            extension_id,
            storage::extension_registrations::UpdatableFields {
                status: Some(Status::Disabled.to_string()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await?;

        // The token the extension used to call back into Gofer dies with it.
        if !registration.key_id.is_empty() {
            if let Err(e) = storage::tokens::delete(&mut conn, &registration.key_id).await {
                debug!(extension_id = extension_id, error = %e, "Could not remove extension token during uninstall");
            }
        }

        // Orphaned subscriptions are moved to an error state so their pipelines surface the
        // problem instead of silently never firing again.
        let subscriptions =
            storage::extension_subscriptions::list_by_extension(&mut conn, extension_id).await?;

        for subscription in subscriptions {
            if let Err(e) = storage::extension_subscriptions::update(
                &mut conn,
                &subscription.namespace_id,
                &subscription.pipeline_id,
                extension_id,
                &subscription.extension_label,
                storage::extension_subscriptions::UpdatableFields {
                    status: Some(crate::api::subscriptions::Status::Error.to_string()),
                    status_reason: Some(format!(
                        "extension '{extension_id}' was uninstalled"
                    )),
                    ..Default::default()
                },
            )
            .await
            {
                error!(extension_id = extension_id, error = %e, "Could not mark subscription errored during uninstall");
            }
        }

        self.event_bus
            .publish(event_utils::Kind::ExtensionUninstalled {
                extension_id: extension_id.into(),
                image: registration.image,
            })
            .await;

        Ok(())
    }

    /// Re-enable a disabled extension and start its process. Management access only.
    pub async fn enable_extension(self: &Arc<Self>, extension_id: &str) -> Result<(), ApiError> {
        let mut registration = self.get_extension(extension_id).await?;

        let mut conn = self.storage.conn().await?;

        storage::extension_registrations::update(
            &mut conn,
            extension_id,
            storage::extension_registrations::UpdatableFields {
                status: Some(Status::Enabled.to_string()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await?;

        drop(conn);

        if !self.extensions.contains_key(extension_id) {
            registration.status = Status::Enabled;

            start_extension(self.clone(), registration).await.map_err(|e| {
                ApiError::Unavailable(format!(
                    "extension '{extension_id}' was enabled but could not be started; {e:#}"
                ))
            })?;
        }

        self.event_bus
            .publish(event_utils::Kind::ExtensionEnabled {
                extension_id: extension_id.into(),
            })
            .await;

        Ok(())
    }

    /// Disable an extension and stop its process; the registration and its subscriptions are
    /// kept. Management access only.
    pub async fn disable_extension(&self, extension_id: &str) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::extension_registrations::update(
            &mut conn,
            extension_id,
            storage::extension_registrations::UpdatableFields {
                status: Some(Status::Disabled.to_string()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => {
                ApiError::NotFound(format!("extension '{extension_id}' does not exist"))
            }
            _ => err.into(),
        })?;

        drop(conn);

        self.extensions.remove(extension_id);

        if let Err(e) = self
            .scheduler
            .stop_container(scheduler::StopContainerRequest {
                name: extension_container_id(extension_id),
                timeout: self.conf.extensions.stop_timeout as i64,
            })
            .await
        {
            debug!(extension_id = extension_id, error = %e, "Could not stop extension container during disable");
        }

        self.event_bus
            .publish(event_utils::Kind::ExtensionDisabled {
                extension_id: extension_id.into(),
            })
            .await;

        Ok(())
    }
}

/// Start every enabled extension from storage. Called once at boot.
pub async fn start_extensions(api: Arc<Api>) -> Result<()> {
    let registrations = api
        .list_extensions()
        .await
        .map_err(|e| anyhow!("{e}"))
        .context("Could not list extension registrations")?;

    for registration in registrations {
        if registration.status != Status::Enabled {
            continue;
        }

        let extension_id = registration.extension_id.clone();

        if let Err(e) = start_extension(api.clone(), registration).await {
            error!(extension_id = extension_id, error = %e, "Could not start extension during boot");
        }
    }

    Ok(())
}

/// Gracefully shut down every running extension. Called on service shutdown.
pub async fn stop_extensions(api: Arc<Api>) {
    let extension_ids: Vec<String> = api
        .extensions
        .iter()
        .map(|entry| entry.key().clone())
        .collect();

    for extension_id in extension_ids {
        if let Ok(client) = api.extension_client(&extension_id) {
            if let Err(e) = client.shutdown().await {
                debug!(extension_id = extension_id, error = %e, "Could not deliver shutdown to extension");
            }
        }

        if let Err(e) = api
            .scheduler
            .stop_container(scheduler::StopContainerRequest {
                name: extension_container_id(&extension_id),
                timeout: api.conf.extensions.stop_timeout as i64,
            })
            .await
        {
            debug!(extension_id = extension_id, error = %e, "Could not stop extension container");
        }

        api.extensions.remove(&extension_id);
    }
}

/// Launch a single extension: rotate its API token, start the container with the protocol's
/// startup environment, wait for a healthy Info response, cache the live handle, and kick off
/// the watcher that relays its trigger events.
pub async fn start_extension(api: Arc<Api>, registration: Registration) -> Result<()> {
    let extension_id = registration.extension_id.clone();

    // The stored token hash can't be turned back into a plaintext, so every start mints a fresh
    // token for the extension and retires the previous one.
    let (secret, token) = api
        .create_token(
            tokens::TokenType::Client,
            vec![".*".into()],
            HashMap::from([
                ("created_by".into(), "extension_token".into()),
                ("extension_id".into(), extension_id.clone()),
            ]),
            EXTENSION_TOKEN_EXPIRY,
        )
        .await
        .map_err(|e| anyhow!("{e}"))
        .context("Could not create token for extension")?;

    {
        let mut conn = api
            .storage
            .conn()
            .await
            .context("Could not open connection to database")?;

        if !registration.key_id.is_empty() {
            if let Err(e) = storage::tokens::delete(&mut conn, &registration.key_id).await {
                debug!(extension_id = extension_id, error = %e, "Could not remove previous extension token");
            }
        }

        storage::extension_registrations::update(
            &mut conn,
            &extension_id,
            storage::extension_registrations::UpdatableFields {
                key_id: Some(token.id.clone()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await
        .context("Could not update extension registration with new token")?;
    }

    let mut variables: HashMap<String, String> = registration
        .settings
        .iter()
        .map(|variable| (variable.key.clone(), variable.value.clone()))
        .collect();

    variables.insert(
        gofer_sdk::extension::ENV_ID.into(),
        extension_id.clone(),
    );
    variables.insert(gofer_sdk::extension::ENV_KEY.into(), secret.clone());
    variables.insert(
        gofer_sdk::extension::ENV_GOFER_HOST.into(),
        api.conf.server.extension_address.clone(),
    );
    variables.insert(
        gofer_sdk::extension::ENV_BIND_ADDRESS.into(),
        EXTENSION_BIND_ADDRESS.into(),
    );
    variables.insert(
        gofer_sdk::extension::ENV_LOG_LEVEL.into(),
        api.conf.api.log_level.clone(),
    );
    variables.insert(
        gofer_sdk::extension::ENV_USE_TLS.into(),
        api.conf.extensions.use_tls.to_string(),
    );

    if api.conf.extensions.use_tls {
        let cert_path = api
            .conf
            .extensions
            .tls_cert_path
            .as_ref()
            .ok_or_else(|| anyhow!("extensions.use_tls is on but tls_cert_path is unset"))?;
        let key_path = api
            .conf
            .extensions
            .tls_key_path
            .as_ref()
            .ok_or_else(|| anyhow!("extensions.use_tls is on but tls_key_path is unset"))?;

        let cert = tokio::fs::read_to_string(cert_path)
            .await
            .context("Could not read extension tls certificate")?;
        let key = tokio::fs::read_to_string(key_path)
            .await
            .context("Could not read extension tls key")?;

        variables.insert(gofer_sdk::extension::ENV_TLS_CERT.into(), cert);
        variables.insert(gofer_sdk::extension::ENV_TLS_KEY.into(), key);
    }

    let response = api
        .scheduler
        .start_container(scheduler::StartContainerRequest {
            name: extension_container_id(&extension_id),
            image: registration.image.clone(),
            variables,
            registry_auth: registration
                .registry_auth
                .clone()
                .map(scheduler::RegistryAuth::from),
            always_pull: false,
            enable_networking: true,
            entrypoint: None,
            command: Some(vec!["server".into()]),
        })
        .await
        .context("Could not start extension container")?;

    let url = response
        .url
        .ok_or_else(|| anyhow!("scheduler did not return a url for the extension container"))?;

    let client = Client::new(&url, &secret, api.conf.extensions.verify_certs)
        .context("Could not build extension client")?;

    // Extensions need a moment to come up; poll Info until it answers.
    let mut healthy = false;

    for _ in 0..EXTENSION_STARTUP_ATTEMPTS {
        match client.info().await {
            Ok(_) => {
                healthy = true;
                break;
            }
            Err(e) => {
                debug!(extension_id = extension_id, error = %e, "Extension not yet healthy; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    if !healthy {
        return Err(anyhow!(
            "extension '{extension_id}' did not respond to info within startup window"
        ));
    }

    api.extensions.insert(
        extension_id.clone(),
        Extension {
            registration,
            url,
            secret,
        },
    );

    info!(extension_id = extension_id, "Started extension");

    tokio::spawn(watch_extension(api.clone(), extension_id));

    Ok(())
}

/// The relay between a single extension and the run launcher: repeatedly polls the extension's
/// watch endpoint and turns every fired event into a run start attempt. Exits once the
/// extension leaves the running set.
async fn watch_extension(api: Arc<Api>, extension_id: String) {
    loop {
        if !api.extensions.contains_key(&extension_id) {
            debug!(extension_id = extension_id, "Extension no longer running; stopping watcher");
            return;
        }

        let client = match api.extension_client(&extension_id) {
            Ok(client) => client,
            Err(_) => return,
        };

        let response = match client.watch().await {
            Ok(response) => response,
            Err(e) => {
                debug!(extension_id = extension_id, error = %e, "Could not poll extension for events; retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for event in response.events {
            external::process_fired_event(&api, &extension_id, event).await;
        }
    }
}
