use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Fanout, SessionStore, Subscription};
use crate::session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};

/// In-process store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, SessionSnapshot>>,
    fanout: Fanout,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        Ok(self.sessions.lock().get(id).cloned())
    }

    async fn write(
        &self,
        id: &SessionId,
        content: String,
        origin: Option<WriteTag>,
    ) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let snapshot = SessionSnapshot::next(sessions.get(id), content, origin);
        sessions.insert(id.clone(), snapshot.clone());
        let reached = self
            .fanout
            .publish(SessionUpdate::new(id.clone(), Some(snapshot.clone())));
        tracing::trace!(session = %id, revision = snapshot.revision, reached, "memory write");
        Ok(snapshot)
    }

    async fn write_if_absent(
        &self,
        id: &SessionId,
        content: String,
    ) -> Result<Option<SessionSnapshot>> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            return Ok(None);
        }
        let snapshot = SessionSnapshot::next(None, content, None);
        sessions.insert(id.clone(), snapshot.clone());
        self.fanout
            .publish(SessionUpdate::new(id.clone(), Some(snapshot.clone())));
        Ok(Some(snapshot))
    }

    async fn subscribe(&self, id: &SessionId) -> Result<Subscription> {
        let sessions = self.sessions.lock();
        Ok(self.fanout.subscribe(id, sessions.get(id).cloned()))
    }

    fn subscriber_count(&self, id: &SessionId) -> usize {
        self.fanout.subscriber_count(id)
    }
}
