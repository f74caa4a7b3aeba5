use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::LifecycleEvent;

const CHANNEL_CAPACITY: usize = 256;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct PublishError(pub String);

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publish failed: {}", self.0)
    }
}

impl std::error::Error for PublishError {}

/// Downstream consumers of lifecycle transitions.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError>;
}

/// Best-effort delivery of a human-readable message to a connected owner.
pub trait RealtimePush: Send + Sync {
    /// Returns whether anyone was connected to receive it.
    fn push(&self, owner_id: Ulid, message: &str) -> bool;
}

/// In-process bus: every subscriber sees every event.
pub struct BroadcastBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError> {
        // No subscribers is not a failure.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Bus that only writes events to the log.
pub struct LogBus;

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError> {
        tracing::info!(
            event_type = %event.event_type,
            booking = %event.booking_id,
            user = %event.user_id,
            expert = %event.expert_id,
            "lifecycle event"
        );
        Ok(())
    }
}

/// Per-owner realtime channels. Subscribing is "being connected".
pub struct PushHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to pushes for an owner. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: Ulid) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop the channel once its last subscriber is gone.
    pub fn prune(&self, owner_id: &Ulid) {
        self.channels
            .remove_if(owner_id, |_, tx| tx.receiver_count() == 0);
    }
}

impl RealtimePush for PushHub {
    fn push(&self, owner_id: Ulid, message: &str) -> bool {
        match self.channels.get(&owner_id) {
            Some(sender) => sender.send(message.to_string()).is_ok(),
            None => false,
        }
    }
}

// ── Outbox ──────────────────────────────────────────────────

pub enum Outbound {
    Event(LifecycleEvent),
    Push { owner_id: Ulid, message: String },
}

/// Bounded queue of side effects drained by one dispatcher task. Enqueue never blocks
/// the caller; overflow and delivery failures are logged and counted.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn spawn(
        bus: Arc<dyn EventBus>,
        push: Arc<dyn RealtimePush>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(dispatch_loop(bus, push, rx));
        (Self { tx }, handle)
    }

    pub fn enqueue(&self, item: Outbound) {
        if let Err(e) = self.tx.try_send(item) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            warn!(reason, "outbox rejected item");
            metrics::counter!(crate::observability::OUTBOX_FAILURES_TOTAL, "kind" => "enqueue")
                .increment(1);
        }
    }
}

async fn dispatch_loop(
    bus: Arc<dyn EventBus>,
    push: Arc<dyn RealtimePush>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Event(event) => {
                match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(event_type = %event.event_type, booking = %event.booking_id, error = %e, "event publish failed");
                        metrics::counter!(crate::observability::OUTBOX_FAILURES_TOTAL, "kind" => "publish")
                            .increment(1);
                    }
                    Err(_) => {
                        warn!(event_type = %event.event_type, booking = %event.booking_id, "event publish timed out");
                        metrics::counter!(crate::observability::OUTBOX_FAILURES_TOTAL, "kind" => "publish")
                            .increment(1);
                    }
                }
            }
            Outbound::Push { owner_id, message } => {
                if !push.push(owner_id, &message) {
                    debug!(owner = %owner_id, "no realtime connection, push skipped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str) -> LifecycleEvent {
        LifecycleEvent {
            event_type: kind.into(),
            booking_id: Ulid::new(),
            user_id: Ulid::new(),
            expert_id: Ulid::new(),
            timestamp: 0,
            event_data: serde_json::json!({}),
        }
    }

    struct BrokenBus;

    #[async_trait]
    impl EventBus for BrokenBus {
        async fn publish(&self, _: &LifecycleEvent) -> Result<(), PublishError> {
            Err(PublishError("broker down".into()))
        }
    }

    #[tokio::test]
    async fn push_to_subscriber() {
        let hub = PushHub::new();
        let owner = Ulid::new();
        let mut rx = hub.subscribe(owner);
        assert!(hub.push(owner, "hello"));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn push_without_connection_is_silent() {
        let hub = PushHub::new();
        assert!(!hub.push(Ulid::new(), "nobody home"));
    }

    #[tokio::test]
    async fn prune_keeps_live_channels() {
        let hub = PushHub::new();
        let owner = Ulid::new();
        let rx = hub.subscribe(owner);
        hub.prune(&owner);
        assert!(hub.push(owner, "still here"));
        drop(rx);
        hub.prune(&owner);
        assert!(!hub.push(owner, "gone"));
    }

    #[tokio::test]
    async fn outbox_delivers_events_and_pushes() {
        let bus = Arc::new(BroadcastBus::new());
        let hub = Arc::new(PushHub::new());
        let mut events = bus.subscribe();
        let owner = Ulid::new();
        let mut pushes = hub.subscribe(owner);

        let (outbox, _task) = Outbox::spawn(bus.clone(), hub.clone(), 8);
        outbox.enqueue(Outbound::Event(event("booking.created")));
        outbox.enqueue(Outbound::Push {
            owner_id: owner,
            message: "new booking".into(),
        });

        let got = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(got.event_type, "booking.created");
        let msg = tokio::time::timeout(Duration::from_secs(1), pushes.recv()).await.unwrap().unwrap();
        assert_eq!(msg, "new booking");
    }

    #[tokio::test]
    async fn outbox_survives_publish_failures() {
        let hub = Arc::new(PushHub::new());
        let owner = Ulid::new();
        let mut pushes = hub.subscribe(owner);

        let (outbox, _task) = Outbox::spawn(Arc::new(BrokenBus), hub.clone(), 8);
        outbox.enqueue(Outbound::Event(event("booking.confirmed")));
        outbox.enqueue(Outbound::Push {
            owner_id: owner,
            message: "after failure".into(),
        });

        let msg = tokio::time::timeout(Duration::from_secs(1), pushes.recv()).await.unwrap().unwrap();
        assert_eq!(msg, "after failure");
    }
}
