use crate::api::{epoch_milli, runs, task_executions};
use crate::storage::{self, StorageError};
use anyhow::{Context, Result};
use crossbeam::channel;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumDiscriminants, EnumString};
use tracing::{debug, error, info, trace};

/// The amount of events a single subscriber can buffer before publishes start to block. Delivery
/// is deliberately synchronous; see [`EventBus::publish`].
const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Page size used when streaming the historical event log out of storage.
const GET_ALL_PAGE_SIZE: u64 = 10;

/// Page size used by the prune loop while scanning for expired events.
const PRUNE_PAGE_SIZE: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("could not find event '{0}'")]
    NotFound(u64),

    #[error("could not persist event to storage; {0}")]
    Storage(String),

    #[error("could not parse event from storage; {0}")]
    Malformed(String),
}

/// The kinds of events the system emits. Every variant carries the identifying coordinates of the
/// entity it concerns; the variant name doubles as the storage/filter discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display, EnumDiscriminants)]
#[strum_discriminants(name(KindDiscriminant))]
#[strum_discriminants(derive(EnumString, Display, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// The Any kind is a special event kind that denotes the caller wants to listen for any
    /// event. It should not be published.
    Any,

    // Namespace events
    NamespaceCreated {
        namespace_id: String,
    },
    NamespaceDeleted {
        namespace_id: String,
    },

    // Pipeline events
    PipelineRegistered {
        namespace_id: String,
        pipeline_id: String,
    },
    PipelineEnabled {
        namespace_id: String,
        pipeline_id: String,
    },
    PipelineDisabled {
        namespace_id: String,
        pipeline_id: String,
    },
    PipelineDeleted {
        namespace_id: String,
        pipeline_id: String,
    },

    // Pipeline config events
    PipelineConfigRegistered {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },

    // Deployment events
    PipelineDeployStarted {
        namespace_id: String,
        pipeline_id: String,
        start_version: u64,
        end_version: u64,
    },
    PipelineDeployCompleted {
        namespace_id: String,
        pipeline_id: String,
        start_version: u64,
        end_version: u64,
    },

    // Run events
    RunStarted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
    },
    RunCompleted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        status: runs::Status,
    },
    RunCancellationStarted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        force: bool,
    },

    // Task execution events
    TaskRunCreated {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
    },
    TaskRunStarted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
    },
    TaskRunCompleted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
        status: task_executions::Status,
    },
    TaskRunCancellationStarted {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
        timeout: u64,
    },

    // Extension events
    ExtensionInstalled {
        extension_id: String,
        image: String,
    },
    ExtensionUninstalled {
        extension_id: String,
        image: String,
    },
    ExtensionEnabled {
        extension_id: String,
    },
    ExtensionDisabled {
        extension_id: String,
    },
    ExtensionFired {
        extension_id: String,
        namespace_id: String,
        pipeline_id: String,
        label: String,
    },

    // Subscription events
    SubscriptionCreated {
        namespace_id: String,
        pipeline_id: String,
        extension_id: String,
        label: String,
    },
    SubscriptionRemoved {
        namespace_id: String,
        pipeline_id: String,
        extension_id: String,
        label: String,
    },
}

/// A single event. The id is globally monotonic and assigned by storage at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, monotonically increasing identifier.
    pub id: u64,

    /// The type of event it is.
    pub kind: Kind,

    /// Time event was emitted in epoch milliseconds.
    pub emitted: u64,
}

impl Event {
    pub fn new(kind: Kind) -> Self {
        Self {
            id: 0,
            kind,
            emitted: epoch_milli(),
        }
    }
}

impl TryFrom<storage::events::Event> for Event {
    type Error = EventError;

    fn try_from(value: storage::events::Event) -> Result<Self, Self::Error> {
        let emitted = value.emitted.parse::<u64>().map_err(|_| {
            EventError::Malformed(format!(
                "could not parse field 'emitted' from storage value '{}'",
                value.emitted
            ))
        })?;

        let kind: Kind = serde_json::from_str(&value.details).map_err(|e| {
            EventError::Malformed(format!(
                "could not parse field 'details' from storage value; {e}"
            ))
        })?;

        Ok(Event {
            id: value.id as u64,
            kind,
            emitted,
        })
    }
}

impl TryFrom<&Event> for storage::events::Event {
    type Error = EventError;

    fn try_from(value: &Event) -> Result<Self, Self::Error> {
        let details = serde_json::to_string(&value.kind).map_err(|e| {
            EventError::Malformed(format!("could not serialize event for storage; {e}"))
        })?;

        Ok(Self {
            id: value.id as i64,
            kind: KindDiscriminant::from(&value.kind).to_string(),
            details,
            emitted: value.emitted.to_string(),
        })
    }
}

/// A mapping of each event kind to the subscription id and sender end of the delivery channel.
/// When publishing events we need just a lookup by event kind, but when removing a subscription
/// we need to be able to look up by event kind and subscription id.
type EventChannelMap = DashMap<KindDiscriminant, DashMap<String, channel::Sender<Event>>>;

/// A handle to a live event feed. The receiving end gets every matching event in publish (and
/// therefore id) order. Dropping the subscription removes it from the bus.
pub struct Subscription<'a> {
    id: String,
    kind: KindDiscriminant,
    event_bus: &'a EventBus,
    pub receiver: channel::Receiver<Event>,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.event_bus.remove_subscription(self.kind, &self.id);
    }
}

/// The event bus is a central handler for all things related to events within the application.
/// It allows the caller to listen to and emit events.
///
/// Delivery to subscribers is synchronous and happens in storage id order; a subscriber that
/// stops draining its channel eventually blocks publishers. That is the intended design: handing
/// events off to a per-subscriber task would allow reordering.
#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    event_channel_map: std::sync::Arc<EventChannelMap>,
}

impl EventBus {
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let event_bus = Self {
            storage: storage.clone(),
            event_channel_map: std::sync::Arc::new(DashMap::new()),
        };

        tokio::spawn(async move {
            loop {
                match prune_events(&storage, retention).await {
                    Ok(_) => (),
                    Err(e) => {
                        error!(error = %e, "encountered an error during attempt to prune old events")
                    }
                };

                tokio::time::sleep(tokio::time::Duration::from_secs(prune_interval)).await;
            }
        });

        event_bus
    }

    /// Returns a subscription which can be used to listen to events of the given kind (or
    /// [`KindDiscriminant::Any`] for everything). The subscription automatically unsubscribes
    /// on drop.
    pub fn subscribe(&self, kind: KindDiscriminant) -> Subscription<'_> {
        let subscription_map = self.event_channel_map.entry(kind).or_default();

        let (sender, receiver) = channel::bounded::<Event>(EVENT_CHANNEL_CAPACITY);
        let new_subscription = Subscription {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            event_bus: self,
            receiver,
        };

        subscription_map.insert(new_subscription.id.clone(), sender);

        new_subscription
    }

    fn remove_subscription(&self, kind: KindDiscriminant, id: &str) {
        if let Some(subscription_map) = self.event_channel_map.get(&kind) {
            subscription_map.remove(id);
        }
    }

    /// Retrieve a single historical event by id.
    pub async fn get(&self, id: u64) -> Result<Event, EventError> {
        let mut conn = self
            .storage
            .conn()
            .await
            .map_err(|e| EventError::Storage(e.to_string()))?;

        let event = storage::events::get(&mut conn, id as i64)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => EventError::NotFound(id),
                _ => EventError::Storage(e.to_string()),
            })?;

        event.try_into()
    }

    /// Stream the entire historical event log. Events arrive in id order (or reverse id order
    /// when `reverse` is set); the channel closes once storage runs out of pages or returns an
    /// error.
    pub fn get_all(&self, reverse: bool) -> tokio::sync::mpsc::Receiver<Event> {
        let (sender, receiver) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let storage = self.storage.clone();

        tokio::spawn(async move {
            let mut offset = 0;

            loop {
                let mut conn = match storage.conn().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "could not stream events; connection error");
                        return;
                    }
                };

                let events =
                    match storage::events::list(&mut conn, offset, GET_ALL_PAGE_SIZE, reverse)
                        .await
                    {
                        Ok(events) => events,
                        Err(e) => {
                            error!(error = %e, "could not stream events; storage error");
                            return;
                        }
                    };

                let page_len = events.len() as u64;

                for event in events {
                    let event: Event = match event.try_into() {
                        Ok(event) => event,
                        Err(e) => {
                            error!(error = %e, "could not stream events; malformed event");
                            return;
                        }
                    };

                    if sender.send(event).await.is_err() {
                        // Receiver hung up; nothing left to do.
                        return;
                    }
                }

                if page_len != GET_ALL_PAGE_SIZE {
                    return;
                }

                offset += page_len;
            }
        });

        receiver
    }

    /// Allows the caller to emit a new event to the eventbus. Returns the published event,
    /// including its storage-assigned id, once every current subscriber has received it.
    ///
    /// An event whose storage insert fails is logged and NOT delivered to subscribers; delivering
    /// an unpersisted event would break the durability ordering subscribers rely on.
    pub async fn publish(&self, kind: Kind) -> Option<Event> {
        let mut new_event = Event::new(kind);

        let mut conn = match self.storage.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(kind = %new_event.kind, error = %e, "could not publish event");
                return None;
            }
        };

        let storage_event: storage::events::Event = match (&new_event).try_into() {
            Ok(event) => event,
            Err(e) => {
                error!(kind = %new_event.kind, error = %e, "could not publish event");
                return None;
            }
        };

        let id = match storage::events::insert(&mut conn, &storage_event).await {
            Ok(id) => id,
            Err(e) => {
                error!(kind = %new_event.kind, error = %e, "could not publish event");
                return None;
            }
        };

        new_event.id = id as u64;

        trace!(id = new_event.id, kind = %new_event.kind, "new event");

        // Delivery happens inline so that every subscriber observes events in exactly the order
        // storage assigned their ids. A full subscriber buffer blocks here rather than reorder.
        if let Some(specific_event_subs) = self
            .event_channel_map
            .get(&KindDiscriminant::from(&new_event.kind))
        {
            for item in specific_event_subs.iter() {
                if let Err(e) = item.value().send(new_event.clone()) {
                    error!(kind = %new_event.kind, error = %e, "could not deliver event to subscriber");
                }
            }
        }

        if let Some(any_event_subs) = self.event_channel_map.get(&KindDiscriminant::Any) {
            for item in any_event_subs.iter() {
                if let Err(e) = item.value().send(new_event.clone()) {
                    error!(kind = %new_event.kind, error = %e, "could not deliver event to subscriber");
                }
            }
        }

        Some(new_event)
    }
}

/// Walks the event log in ascending id order and deletes any event older than the retention
/// period. Stops at the first short page.
pub(crate) async fn prune_events(storage: &storage::Db, retention: u64) -> Result<(), StorageError> {
    let mut offset = 0;
    let mut total_pruned = 0;

    let mut conn = storage.conn().await?;

    loop {
        let events = storage::events::list(&mut conn, offset, PRUNE_PAGE_SIZE, false).await?;
        let page_len = events.len() as u64;

        for event in &events {
            if is_past_cut_date(event, retention) {
                debug!(
                    id = event.id,
                    emitted = event.emitted,
                    retention = retention,
                    "removed event past retention period"
                );

                total_pruned += 1;

                storage::events::delete(&mut conn, event.id).await?;
            }
        }

        if page_len != PRUNE_PAGE_SIZE {
            if total_pruned > 0 {
                info!(
                    retention = retention,
                    total_pruned = total_pruned,
                    "pruned old events"
                );
            }

            return Ok(());
        }

        offset += page_len;
    }
}

fn is_past_cut_date(event: &storage::events::Event, retention: u64) -> bool {
    let now = epoch_milli();
    let limit = Duration::from_secs(retention).as_millis() as u64;

    let emitted = match event.emitted.parse::<u64>() {
        Ok(emitted) => emitted,
        Err(_) => return false,
    };

    emitted < now.saturating_sub(limit)
}

/// Parse a subscriber-supplied kind filter; the string "any" maps to the wildcard.
pub fn parse_kind_filter(filter: &str) -> Result<KindDiscriminant> {
    KindDiscriminant::from_str(filter)
        .with_context(|| format!("'{filter}' is not a recognized event kind"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    fn test_kind(namespace_id: &str) -> Kind {
        Kind::NamespaceCreated {
            namespace_id: namespace_id.into(),
        }
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_ids_and_delivers_in_order() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        let subscription = event_bus.subscribe(KindDiscriminant::NamespaceCreated);

        for i in 0..5 {
            event_bus.publish(test_kind(&format!("ns_{i}"))).await;
        }

        let mut last_id = 0;
        for _ in 0..5 {
            let event = subscription.receiver.recv().unwrap();
            assert!(event.id > last_id, "subscriber saw non-increasing event id");
            last_id = event.id;
        }
    }

    #[tokio::test]
    async fn wildcard_subscribers_receive_every_kind() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        let subscription = event_bus.subscribe(KindDiscriminant::Any);

        event_bus.publish(test_kind("ns_one")).await;
        event_bus
            .publish(Kind::PipelineDisabled {
                namespace_id: "ns_one".into(),
                pipeline_id: "pipeline_one".into(),
            })
            .await;

        let first = subscription.receiver.recv().unwrap();
        let second = subscription.receiver.recv().unwrap();

        assert!(matches!(first.kind, Kind::NamespaceCreated { .. }));
        assert!(matches!(second.kind, Kind::PipelineDisabled { .. }));
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn dropped_subscriptions_no_longer_receive() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        let subscription = event_bus.subscribe(KindDiscriminant::NamespaceCreated);
        let receiver = subscription.receiver.clone();
        drop(subscription);

        event_bus.publish(test_kind("ns_one")).await;

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_returns_published_and_errors_on_missing() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        let published = event_bus.publish(test_kind("ns_one")).await.unwrap();

        let fetched = event_bus.get(published.id).await.unwrap();
        assert_eq!(fetched, published);

        let missing = event_bus.get(999).await.unwrap_err();
        assert!(matches!(missing, EventError::NotFound(999)));
    }

    #[tokio::test]
    async fn get_all_pages_through_history() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        // More than a single page to exercise the paging loop.
        for i in 0..25 {
            event_bus.publish(test_kind(&format!("ns_{i}"))).await;
        }

        let mut receiver = event_bus.get_all(false);
        let mut count = 0;
        let mut last_id = 0;

        while let Some(event) = receiver.recv().await {
            assert!(event.id > last_id);
            last_id = event.id;
            count += 1;
        }

        assert_eq!(count, 25);

        let mut receiver = event_bus.get_all(true);
        let first = receiver.recv().await.unwrap();
        assert_eq!(first.id, 25);
    }

    #[tokio::test]
    async fn prune_removes_only_events_past_retention() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 86400, 86400);

        let first = event_bus.publish(test_kind("ns_one")).await.unwrap();
        event_bus.publish(test_kind("ns_two")).await.unwrap();
        event_bus.publish(test_kind("ns_three")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        // Everything published so far is now older than a one second retention.
        prune_events(&harness.db, 1).await.unwrap();

        let fourth = event_bus.publish(test_kind("ns_four")).await.unwrap();

        let result = event_bus.get(first.id).await.unwrap_err();
        assert!(matches!(result, EventError::NotFound(_)));

        let fetched = event_bus.get(fourth.id).await.unwrap();
        assert_eq!(fetched.id, fourth.id);
        assert!(fetched.id > first.id);
    }
}
