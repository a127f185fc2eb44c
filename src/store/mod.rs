//! Session stores: where the shared text lives and how changes fan out.
//!
//! Every backend implements [`SessionStore`]. Writes fully replace a
//! session's content and are pushed to all live subscriptions of that
//! session, the writer's own included.

pub mod fanout;
pub mod memory;
pub mod remote;
pub mod sqlite;

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};

pub use fanout::Fanout;
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    async fn read(&self, id: &SessionId) -> Result<Option<SessionSnapshot>>;

    /// Replace the content of `id`, creating the session if needed.
    async fn write(
        &self,
        id: &SessionId,
        content: String,
        origin: Option<WriteTag>,
    ) -> Result<SessionSnapshot>;

    /// Create `id` with `content` unless it already exists. Returns `None`
    /// when the session was already there.
    async fn write_if_absent(
        &self,
        id: &SessionId,
        content: String,
    ) -> Result<Option<SessionSnapshot>>;

    /// Yields the current value immediately, then every later change.
    async fn subscribe(&self, id: &SessionId) -> Result<Subscription>;

    fn subscriber_count(&self, id: &SessionId) -> usize;

    /// Most recent accepted writes, newest first. `None` when the backend
    /// keeps no history.
    async fn history(
        &self,
        _id: &SessionId,
        _limit: usize,
    ) -> Result<Option<Vec<SessionSnapshot>>> {
        Ok(None)
    }
}

/// A single-consumer stream of [`SessionUpdate`]s for one session.
///
/// Dropping the subscription releases it; no item can be observed after
/// that because the stream is gone with it.
pub struct Subscription {
    session: SessionId,
    inner: BoxStream<'static, SessionUpdate>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<St>(session: SessionId, stream: St) -> Self
    where
        St: Stream<Item = SessionUpdate> + Send + 'static,
    {
        Self {
            session,
            inner: stream.boxed(),
            on_release: None,
        }
    }

    /// Run `release` once when the subscription goes away.
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn unsubscribe(self) {
        tracing::debug!(session = %self.session, "unsubscribed");
    }
}

impl Stream for Subscription {
    type Item = SessionUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session", &self.session)
            .field("inner", &"<stream>")
            .finish()
    }
}
