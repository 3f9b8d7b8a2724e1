//! The wire surface of the extension protocol: the request/response types every extension
//! speaks plus the client Gofer (and extension authors' tooling) uses to talk to a running
//! extension over its authenticated channel.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Route table shared by the client below and the server loop in the parent module.
pub const INFO_ROUTE: &str = "/api/info";
pub const SUBSCRIBE_ROUTE: &str = "/api/subscribe";
pub const UNSUBSCRIBE_ROUTE: &str = "/api/unsubscribe";
pub const WATCH_ROUTE: &str = "/api/watch";
pub const SHUTDOWN_ROUTE: &str = "/api/shutdown";
pub const EXTERNAL_EVENT_ROUTE: &str = "/api/external-event";
pub const INSTALL_ROUTE: &str = "/api/install";
pub const UNINSTALL_ROUTE: &str = "/api/uninstall";

/// A single configuration or subscription parameter an extension documents for its users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub required: bool,
    pub documentation: String,
}

/// Self-reported documentation for an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Documentation {
    /// Configuration parameters that can be passed in at extension startup and control behavior
    /// for the extension's entire lifetime.
    pub config_params: Vec<Parameter>,

    /// Parameters a pipeline passes when it subscribes, controlling how the extension treats
    /// that specific subscription.
    pub pipeline_subscription_params: Vec<Parameter>,

    /// Freeform text inserted into the documentation users can look up about the extension.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    /// The unique extension identifier.
    pub extension_id: String,

    /// Documentation about how to use the extension.
    pub documentation: Documentation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub namespace_id: String,
    pub pipeline_id: String,

    /// The subscription's unique label; a pipeline can hold several subscriptions to the same
    /// extension under different labels.
    pub label: String,

    /// Extension specific settings for this subscription.
    pub settings: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEventRequest {
    /// The raw payload forwarded from the external caller; the extension decides what it means.
    pub payload: Vec<u8>,
}

/// What an extension decided about a particular check of one of its subscriptions.
#[derive(Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum FiredEventResult {
    #[default]
    Unknown,

    /// The subscription's conditions were met; the target pipeline should run.
    Success,

    /// The extension attempted its check and it failed.
    Failure,

    /// The extension decided not to act for this subscription.
    Skipped,
}

/// A trigger event: an extension telling Gofer that one of its subscriptions fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredEvent {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub label: String,
    pub result: FiredEventResult,

    /// Details about the firing, injected into the resulting run as extension-sourced
    /// variables.
    pub metadata: HashMap<String, String>,

    /// A human consumable explanation of why this event fired.
    pub details: String,
}

/// The response to a watch poll. Empty when nothing fired within the extension's poll window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub events: Vec<FiredEvent>,
}

/// Client for a running extension's API. Every request carries the bearer key the extension was
/// started with; the extension rejects anything else.
#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest::Client,
    url: String,
}

impl Client {
    pub fn new(url: &str, secret: &str, verify_certs: bool) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();

        let mut auth_value =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {secret}"))
                .context("Could not construct authorization header for extension client")?;
        auth_value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_certs)
            .build()
            .context("Could not build extension client")?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn route(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("extension returned status {status}; {body}"));
        }

        Ok(response)
    }

    pub async fn info(&self) -> Result<InfoResponse> {
        let response = self.client.get(self.route(INFO_ROUTE)).send().await?;
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .context("Could not deserialize info response from extension")
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<()> {
        let response = self
            .client
            .post(self.route(SUBSCRIBE_ROUTE))
            .json(request)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, request: &UnsubscribeRequest) -> Result<()> {
        let response = self
            .client
            .post(self.route(UNSUBSCRIBE_ROUTE))
            .json(request)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    /// Long-poll the extension for fired trigger events. An empty response is normal; it just
    /// means nothing happened within the extension's poll window.
    pub async fn watch(&self) -> Result<WatchResponse> {
        let response = self.client.get(self.route(WATCH_ROUTE)).send().await?;
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .context("Could not deserialize watch response from extension")
    }

    pub async fn external_event(&self, request: &ExternalEventRequest) -> Result<()> {
        let response = self
            .client
            .post(self.route(EXTERNAL_EVENT_ROUTE))
            .json(request)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let response = self.client.post(self.route(SHUTDOWN_ROUTE)).send().await?;

        Self::check(response).await?;
        Ok(())
    }

    /// Fetch the extension's install instructions; the same document the `installer` subcommand
    /// prints to stdout.
    pub async fn install_instructions(&self) -> Result<super::InstallInstructions> {
        let response = self.client.get(self.route(INSTALL_ROUTE)).send().await?;
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .context("Could not deserialize install instructions from extension")
    }

    /// Tell the extension it is being uninstalled so it can release external resources.
    pub async fn uninstall(&self) -> Result<()> {
        let response = self.client.post(self.route(UNINSTALL_ROUTE)).send().await?;

        Self::check(response).await?;
        Ok(())
    }
}
