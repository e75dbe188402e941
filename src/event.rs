//! Invalidation events published when enrichment data changes.
//!
//! The cache never talks to a global bus. It is handed something that
//! implements [`Publish`] at construction time; [`EventBus`] is the stock
//! implementation, fanning events out to every subscribed view.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{Fingerprint, ItemId};

/// A structured event emitted by the subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A population fetch completed and merged into the cache.
    EnrichmentUpdated {
        item: ItemId,
        fingerprint: Fingerprint,
        records: usize,
    },
}

impl EventKind {
    /// The item whose views should re-render.
    pub fn item(&self) -> &ItemId {
        match self {
            EventKind::EnrichmentUpdated { item, .. } => item,
        }
    }
}

/// Observer interface the cache publishes through.
pub trait Publish: Send + Sync {
    fn publish(&self, kind: EventKind);
}

impl<F> Publish for F
where
    F: Fn(EventKind) + Send + Sync,
{
    fn publish(&self, kind: EventKind) {
        self(kind)
    }
}

/// Broadcast bus with sequence numbering.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the last published event (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publish for EventBus {
    fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::AcqRel) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine; nobody is rendering.
        match self.tx.send(event) {
            Ok(receivers) => debug!(receivers, "event published"),
            Err(_) => debug!("event published with no subscribers"),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("last_seq", &self.last_seq())
            .finish()
    }
}
