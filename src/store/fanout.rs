use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::Subscription;
use crate::session::{SessionId, SessionSnapshot, SessionUpdate};

pub const DEFAULT_CAPACITY: usize = 256;

/// Per-session broadcast channels.
///
/// Callers must hold their own storage lock around `publish` and
/// `subscribe` so a subscriber's initial value and the updates that
/// follow it are consistently ordered.
pub struct Fanout {
    channels: DashMap<SessionId, broadcast::Sender<SessionUpdate>>,
    capacity: usize,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the number of subscriptions the update reached.
    pub fn publish(&self, update: SessionUpdate) -> usize {
        let id = update.session.clone();
        let delivered = match self.channels.get(&id) {
            Some(tx) => tx.send(update).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.channels.remove_if(&id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    pub fn subscribe(&self, id: &SessionId, current: Option<SessionSnapshot>) -> Subscription {
        let rx = self
            .channels
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let initial = SessionUpdate::new(id.clone(), current);
        let session = id.clone();
        let live = BroadcastStream::new(rx).filter_map(move |item| {
            let item = match item {
                Ok(update) => Some(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session = %session,
                        skipped,
                        "subscriber lagged; skipping to newest"
                    );
                    None
                }
            };
            futures::future::ready(item)
        });

        Subscription::new(id.clone(), stream::once(futures::future::ready(initial)).chain(live))
    }

    pub fn subscriber_count(&self, id: &SessionId) -> usize {
        self.channels
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
