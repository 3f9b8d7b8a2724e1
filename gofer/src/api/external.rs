use crate::api::{event_utils, runs, Api, ApiError};
use gofer_sdk::extension::api::{ExternalEventRequest, FiredEvent, FiredEventResult};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Handle a trigger event fired by an extension: translate it into a run start against the
/// subscribed pipeline and announce it on the bus. Non-success results are recorded and
/// dropped; only a successful check starts a run.
pub async fn process_fired_event(api: &Arc<Api>, extension_id: &str, event: FiredEvent) {
    match event.result {
        FiredEventResult::Success => {}
        FiredEventResult::Failure => {
            error!(
                extension_id = extension_id,
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                label = event.label,
                details = event.details,
                "Extension reported a failed check for subscription"
            );
            return;
        }
        FiredEventResult::Skipped | FiredEventResult::Unknown => {
            debug!(
                extension_id = extension_id,
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                label = event.label,
                "Extension skipped subscription check"
            );
            return;
        }
    }

    api.event_bus
        .publish(event_utils::Kind::ExtensionFired {
            extension_id: extension_id.into(),
            namespace_id: event.namespace_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
            label: event.label.clone(),
        })
        .await;

    match api
        .start_run(
            &event.namespace_id,
            &event.pipeline_id,
            runs::Initiator::Extension {
                extension_id: extension_id.into(),
                label: event.label.clone(),
            },
            event.metadata,
        )
        .await
    {
        Ok(run) => {
            info!(
                extension_id = extension_id,
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                run_id = run.run_id,
                "Started run from extension trigger event"
            );
        }
        Err(e) => {
            error!(
                extension_id = extension_id,
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                label = event.label,
                error = %e,
                "Could not start run for extension trigger event"
            );
        }
    }
}

impl Api {
    /// Forward an opaque external payload to an extension over its authenticated channel. What
    /// the payload means (a webhook body, a chat command) is entirely up to the extension.
    pub async fn forward_external_event(
        &self,
        extension_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), ApiError> {
        let client = self.extension_client(extension_id)?;

        client
            .external_event(&ExternalEventRequest { payload })
            .await
            .map_err(|e| {
                ApiError::Unavailable(format!(
                    "could not deliver external event to extension '{extension_id}'; {e}"
                ))
            })
    }
}
