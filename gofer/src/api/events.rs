use crate::api::{event_utils, Api, ApiError};

impl Api {
    /// Retrieve a single historical event by id.
    pub async fn get_event(&self, id: u64) -> Result<event_utils::Event, ApiError> {
        self.event_bus.get(id).await.map_err(|err| match err {
            event_utils::EventError::NotFound(id) => {
                ApiError::NotFound(format!("event '{id}' does not exist"))
            }
            _ => ApiError::Internal(err.to_string()),
        })
    }

    /// Stream the historical event log in id order (or reverse). The channel ends when history
    /// is exhausted; it does not follow new events, use [`Api::subscribe_events`] for that.
    pub fn list_events(&self, reverse: bool) -> tokio::sync::mpsc::Receiver<event_utils::Event> {
        self.event_bus.get_all(reverse)
    }

    /// Subscribe to live events of a particular kind; the filter string "any" subscribes to
    /// everything. The subscription drops its registration when dropped.
    pub fn subscribe_events(
        &self,
        kind_filter: &str,
    ) -> Result<event_utils::Subscription<'_>, ApiError> {
        let kind = event_utils::parse_kind_filter(kind_filter)
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        Ok(self.event_bus.subscribe(kind))
    }
}
