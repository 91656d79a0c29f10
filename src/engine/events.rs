//! Change notifications published by a [`Database`](crate::engine::Database).
//!
//! Events are only produced when `trigger_update_events` is enabled. Subscribers receive
//! them over an `mpsc` channel; a subscriber that drops its receiver is forgotten on the
//! next publish.

use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::RwLock;

/// Key carried by the single event a [`clear`](crate::engine::Database::clear) emits.
pub const CLEAR_ALL_KEY: &str = "ALL";

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Upsert,
    Remove,
}

/// One mutation of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    /// For upserts the logical value before per-value encryption; for removals the
    /// stored value that was removed. `None` for a clear.
    pub value: Option<Vec<u8>>,
    pub change_type: ChangeType,
}

impl ChangeEvent {
    pub fn upsert(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            change_type: ChangeType::Upsert,
        }
    }

    pub fn remove(key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value,
            change_type: ChangeType::Remove,
        }
    }

    pub fn clear_all() -> Self {
        Self::remove(CLEAR_ALL_KEY, None)
    }

    pub fn is_clear_all(&self) -> bool {
        self.change_type == ChangeType::Remove && self.key == CLEAR_ALL_KEY && self.value.is_none()
    }
}

/// Fan-out of change events to every live subscriber.
#[derive(Default)]
pub(crate) struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    pub(crate) fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: ChangeEvent) {
        if self.subscribers.read().is_empty() {
            return;
        }
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
