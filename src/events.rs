//! Event Module
//!
//! Fire-and-forget notifications about entry state changes. Delivery is never
//! part of the core's correctness: a listener that drops events, or panics on
//! a closed channel, must not affect the operation that raised them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

// == Event Kind ==
/// What happened to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The entry's expiration hint lapsed and the entry was removed.
    Expired,
    /// A lock acquisition on the entry failed or timed out.
    LockAcquireFailed,
    /// The entry was re-placed while an attribute index was rebuilt.
    IndexRebuilt {
        /// Attribute whose index was rebuilt
        attribute: String,
    },
}

// == Cache Event ==
/// A single notification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEvent {
    /// Entry the event concerns
    pub key: String,
    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
    /// When the core observed it
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    /// Creates a new event record.
    pub fn new(key: impl Into<String>, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            kind,
            timestamp,
        }
    }
}

/// Trait for the customized event listener.
pub trait EventListener: Send + Sync + 'static {
    /// Called once per event, on the thread that raised it.
    fn on_event(&self, event: CacheEvent);
}

// == Noop Listener ==
/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _event: CacheEvent) {}
}

// == Channel Listener ==
/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: UnboundedSender<CacheEvent>,
}

impl ChannelListener {
    /// Creates a listener and the receiving end of its channel.
    pub fn new() -> (Self, UnboundedReceiver<CacheEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: CacheEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}
