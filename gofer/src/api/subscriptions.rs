use crate::api::{
    event_utils, is_valid_identifier, pipeline_configs, Api, ApiError,
};
use crate::storage;
use anyhow::{Context, Result};
use gofer_sdk::extension::api::{SubscribeRequest, UnsubscribeRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::{debug, error};

#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    /// The extension has acknowledged the subscription and will fire events for it.
    Active,

    /// The subscription could not be established or its extension went away; the reason is in
    /// status_reason.
    Error,

    /// The subscription is administratively paused.
    Disabled,
}

/// A binding between a pipeline and an extension. Subscriptions are the sole mechanism by which
/// an extension learns which pipelines it should fire for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    /// The extension this subscription routes to.
    pub extension_id: String,

    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// A unique label for this subscription within the pipeline/extension pair.
    pub label: String,

    /// Extension specific settings for this subscription.
    pub settings: HashMap<String, String>,

    /// Whether the extension currently honors this subscription.
    pub status: Status,

    /// Details on how the subscription got into its current status.
    pub status_reason: Option<String>,
}

impl TryFrom<storage::extension_subscriptions::ExtensionSubscription> for Subscription {
    type Error = anyhow::Error;

    fn try_from(value: storage::extension_subscriptions::ExtensionSubscription) -> Result<Self> {
        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let settings = serde_json::from_str(&value.settings)
            .context("Could not parse field 'settings' from storage value")?;

        let status_reason = if value.status_reason.is_empty() {
            None
        } else {
            Some(value.status_reason)
        };

        Ok(Subscription {
            extension_id: value.extension_id,
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            label: value.extension_label,
            settings,
            status,
            status_reason,
        })
    }
}

impl TryFrom<Subscription> for storage::extension_subscriptions::ExtensionSubscription {
    type Error = anyhow::Error;

    fn try_from(value: Subscription) -> Result<Self> {
        Ok(Self {
            extension_id: value.extension_id,
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            extension_label: value.label,
            settings: serde_json::to_string(&value.settings)
                .context("Could not serialize field 'settings' into storage value")?,
            status: value.status.to_string(),
            status_reason: value.status_reason.unwrap_or_default(),
        })
    }
}

impl Api {
    /// List every subscription a pipeline holds.
    pub async fn list_subscriptions(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<Vec<Subscription>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_subscriptions = storage::extension_subscriptions::list_by_pipeline(
            &mut conn,
            namespace_id,
            pipeline_id,
        )
        .await?;

        let mut subscriptions = vec![];

        for storage_subscription in storage_subscriptions {
            subscriptions.push(Subscription::try_from(storage_subscription)?);
        }

        Ok(subscriptions)
    }

    /// Get a single subscription.
    pub async fn get_subscription(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_id: &str,
        label: &str,
    ) -> Result<Subscription, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_subscription = storage::extension_subscriptions::get(
            &mut conn,
            namespace_id,
            pipeline_id,
            extension_id,
            label,
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "subscription '{label}' to extension '{extension_id}' does not exist for pipeline '{pipeline_id}'"
            )),
            _ => err.into(),
        })?;

        Ok(Subscription::try_from(storage_subscription)?)
    }

    /// Subscribe a pipeline to an extension.
    ///
    /// The extension is informed first; a subscription it refused is still recorded, in the
    /// error state, so the pipeline surfaces the problem.
    pub async fn create_subscription(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_id: &str,
        label: &str,
        settings: HashMap<String, String>,
    ) -> Result<Subscription, ApiError> {
        is_valid_identifier(label)?;

        // The target pipeline has to exist before we involve the extension.
        let mut conn = self.storage.conn().await?;
        storage::pipeline_metadata::get(&mut conn, namespace_id, pipeline_id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => ApiError::NotFound(format!(
                    "pipeline '{pipeline_id}' does not exist in namespace '{namespace_id}'"
                )),
                _ => err.into(),
            })?;
        drop(conn);

        let mut subscription = Subscription {
            extension_id: extension_id.into(),
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            label: label.into(),
            settings: settings.clone(),
            status: Status::Active,
            status_reason: None,
        };

        match self.subscribe_extension(&subscription).await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    namespace_id = namespace_id,
                    pipeline_id = pipeline_id,
                    extension_id = extension_id,
                    label = label,
                    error = %e,
                    "Could not establish subscription with extension"
                );

                subscription.status = Status::Error;
                subscription.status_reason = Some(format!(
                    "could not establish subscription with extension; {e}"
                ));
            }
        }

        let mut conn = self.storage.conn().await?;

        let storage_subscription = subscription
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?;

        storage::extension_subscriptions::insert(&mut conn, &storage_subscription)
            .await
            .map_err(|err| match err {
                storage::StorageError::Exists => ApiError::Exists(format!(
                    "subscription '{label}' to extension '{extension_id}' already exists for pipeline '{pipeline_id}'"
                )),
                _ => err.into(),
            })?;

        self.event_bus
            .publish(event_utils::Kind::SubscriptionCreated {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                extension_id: extension_id.into(),
                label: label.into(),
            })
            .await;

        Ok(subscription)
    }

    /// Remove a pipeline's subscription to an extension.
    pub async fn delete_subscription(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_id: &str,
        label: &str,
    ) -> Result<(), ApiError> {
        // Best effort; an extension that is down won't block the removal.
        if let Err(e) = self
            .unsubscribe_extension(namespace_id, pipeline_id, extension_id, label)
            .await
        {
            debug!(
                namespace_id = namespace_id,
                pipeline_id = pipeline_id,
                extension_id = extension_id,
                label = label,
                error = %e,
                "Could not inform extension of unsubscription"
            );
        }

        let mut conn = self.storage.conn().await?;

        storage::extension_subscriptions::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            extension_id,
            label,
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => ApiError::NotFound(format!(
                "subscription '{label}' to extension '{extension_id}' does not exist for pipeline '{pipeline_id}'"
            )),
            _ => err.into(),
        })?;

        self.event_bus
            .publish(event_utils::Kind::SubscriptionRemoved {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                extension_id: extension_id.into(),
                label: label.into(),
            })
            .await;

        Ok(())
    }

    pub(crate) async fn subscribe_extension(
        &self,
        subscription: &Subscription,
    ) -> Result<(), ApiError> {
        let client = self.extension_client(&subscription.extension_id)?;

        client
            .subscribe(&SubscribeRequest {
                namespace_id: subscription.namespace_id.clone(),
                pipeline_id: subscription.pipeline_id.clone(),
                label: subscription.label.clone(),
                settings: subscription.settings.clone(),
            })
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))
    }

    pub(crate) async fn unsubscribe_extension(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_id: &str,
        label: &str,
    ) -> Result<(), ApiError> {
        let client = self.extension_client(extension_id)?;

        client
            .unsubscribe(&UnsubscribeRequest {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                label: label.into(),
            })
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))
    }
}

/// Reconcile a pipeline's persisted subscriptions against the subscription declarations of a
/// freshly deployed config. Declarations new to (or changed in) the target config are
/// subscribed; declarations that disappeared are unsubscribed and removed. Failures never stop
/// the reconciliation; they are recorded on the subscription and reported back as log lines for
/// the deployment record.
pub async fn reconcile_subscriptions(
    api: &Api,
    namespace_id: &str,
    pipeline_id: &str,
    target: &[pipeline_configs::SubscriptionConfig],
) -> Result<Vec<String>, ApiError> {
    let mut logs = vec![];

    let existing = api.list_subscriptions(namespace_id, pipeline_id).await?;

    // Remove subscriptions that are no longer declared.
    for subscription in &existing {
        let still_declared = target.iter().any(|declared| {
            declared.extension_id == subscription.extension_id
                && declared.label == subscription.label
        });

        if still_declared {
            continue;
        }

        match api
            .delete_subscription(
                namespace_id,
                pipeline_id,
                &subscription.extension_id,
                &subscription.label,
            )
            .await
        {
            Ok(()) => logs.push(format!(
                "removed subscription '{}' to extension '{}'",
                subscription.label, subscription.extension_id
            )),
            Err(e) => logs.push(format!(
                "could not remove subscription '{}' to extension '{}'; {e}",
                subscription.label, subscription.extension_id
            )),
        }
    }

    // Establish newly declared subscriptions.
    for declared in target {
        let already_held = existing.iter().any(|subscription| {
            subscription.extension_id == declared.extension_id
                && subscription.label == declared.label
                && subscription.settings == declared.settings
                && subscription.status == Status::Active
        });

        if already_held {
            continue;
        }

        // A changed declaration replaces the old record entirely.
        if existing.iter().any(|subscription| {
            subscription.extension_id == declared.extension_id
                && subscription.label == declared.label
        }) {
            if let Err(e) = api
                .delete_subscription(
                    namespace_id,
                    pipeline_id,
                    &declared.extension_id,
                    &declared.label,
                )
                .await
            {
                logs.push(format!(
                    "could not replace subscription '{}' to extension '{}'; {e}",
                    declared.label, declared.extension_id
                ));
                continue;
            }
        }

        match api
            .create_subscription(
                namespace_id,
                pipeline_id,
                &declared.extension_id,
                &declared.label,
                declared.settings.clone(),
            )
            .await
        {
            Ok(subscription) if subscription.status == Status::Active => {
                logs.push(format!(
                    "subscribed pipeline to extension '{}' under label '{}'",
                    declared.extension_id, declared.label
                ));
            }
            Ok(subscription) => {
                logs.push(format!(
                    "subscription '{}' to extension '{}' recorded in error state; {}",
                    declared.label,
                    declared.extension_id,
                    subscription.status_reason.unwrap_or_default()
                ));
            }
            Err(e) => {
                logs.push(format!(
                    "could not record subscription '{}' to extension '{}'; {e}",
                    declared.label, declared.extension_id
                ));
            }
        }
    }

    Ok(logs)
}
