use tokio::sync::broadcast;

use super::types::{PrefKey, PrefValue, StoreId};

/// A handle for receiving preference change notifications.
pub type Subscription = broadcast::Receiver<PrefEvent>;

/// Published once the durable store has applied a change.
///
/// A removal publishes one `Removed` event per deleted row; removals that match
/// nothing publish nothing.
#[derive(Clone, Debug, PartialEq)]
pub enum PrefEvent {
    Set { store: StoreId, key: PrefKey, value: PrefValue },
    Removed { store: StoreId, key: PrefKey },
}

impl PrefEvent {
    pub fn key(&self) -> &PrefKey {
        match self {
            PrefEvent::Set { key, .. } | PrefEvent::Removed { key, .. } => key,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PrefBus {
    tx: broadcast::Sender<PrefEvent>,
}

impl PrefBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, ev: PrefEvent) {
        // send() only fails when nobody is subscribed, which is fine.
        let _ = self.tx.send(ev);
    }
}
