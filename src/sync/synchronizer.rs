//! Two-way synchronization of one session's text between a UI surface and
//! a [`SessionStore`].
//!
//! Every local edit is written with a [`WriteTag`] (`client_id` + a
//! strictly increasing `seq`). Outstanding tags are tracked so the change
//! handler can tell its own echoes apart from genuinely remote updates,
//! even when several writes overlap.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{categorize_error, with_retry, ErrorCategory, RetryPolicy, Superseded};
use crate::session::{SessionId, SessionUpdate, WriteTag};
use crate::store::{SessionStore, Subscription};

/// What to do with the optimistic text when a write finally fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Roll the text back to the last value confirmed by the store.
    #[default]
    Revert,
    /// Leave the text as typed and the status at `Syncing` until the next
    /// remote update arrives.
    Keep,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub retry: RetryPolicy,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Mounted, first value not received yet.
    Connecting,
    Connected,
    /// Local writes are outstanding.
    Syncing,
    /// The last local write failed and was rolled back.
    Failed,
    /// The subscription ended (store went away).
    Disconnected,
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncView {
    pub text: String,
    pub status: SyncStatus,
    /// Newest store revision observed through the subscription.
    pub revision: Option<u64>,
    /// Number of change-handler invocations so far.
    pub deliveries: u64,
}

impl SyncView {
    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Acknowledged { revision: u64 },
    /// A newer local edit replaced this one before it could be retried.
    Superseded,
    Failed { error: String },
}

/// How the change handler treated one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Our own write came back; the text already shows it.
    Echo,
    /// Foreign value that one of our outstanding writes will overwrite.
    Deferred,
    /// Foreign value shown to the user.
    Replaced,
    /// The session did not exist; the UI was reset to "".
    Absent,
    /// Older than something already seen.
    Stale,
}

struct SyncState {
    text: String,
    status: SyncStatus,
    confirmed: Option<String>,
    last_revision: Option<u64>,
    /// seq -> revision the store acknowledged it with, once known.
    pending: BTreeMap<u64, Option<u64>>,
    next_seq: u64,
    bootstrapped: bool,
    deliveries: u64,
}

impl SyncState {
    fn new() -> Self {
        Self {
            text: String::new(),
            status: SyncStatus::Connecting,
            confirmed: None,
            last_revision: None,
            pending: BTreeMap::new(),
            next_seq: 1,
            bootstrapped: false,
            deliveries: 0,
        }
    }

    fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Nothing outstanding any more: show what the store holds.
    fn settle(&mut self) {
        if let Some(confirmed) = &self.confirmed {
            if &self.text != confirmed {
                self.text = confirmed.clone();
            }
        }
        self.status = SyncStatus::Connected;
    }
}

struct Shared {
    client_id: Uuid,
    state: Mutex<SyncState>,
    view: watch::Sender<SyncView>,
}

impl Shared {
    fn new(client_id: Uuid) -> Self {
        let state = SyncState::new();
        let (view, _) = watch::channel(Self::view_of(&state));
        Self {
            client_id,
            state: Mutex::new(state),
            view,
        }
    }

    fn view_of(state: &SyncState) -> SyncView {
        SyncView {
            text: state.text.clone(),
            status: state.status,
            revision: state.last_revision,
            deliveries: state.deliveries,
        }
    }

    fn publish(&self, state: &SyncState) {
        self.view.send_replace(Self::view_of(state));
    }

    fn reset_for_mount(&self) {
        let mut st = self.state.lock();
        st.last_revision = None;
        st.bootstrapped = false;
        if st.pending.is_empty() {
            st.status = SyncStatus::Connecting;
        }
        self.publish(&st);
    }

    fn begin_edit(&self, text: String) -> WriteTag {
        let mut st = self.state.lock();
        st.text = text;
        let tag = WriteTag::new(self.client_id, st.next_seq);
        st.next_seq += 1;
        st.pending.insert(tag.seq, None);
        st.status = SyncStatus::Syncing;
        self.publish(&st);
        tag
    }

    fn is_superseded(&self, seq: u64) -> bool {
        self.state.lock().latest_seq() > seq
    }

    fn acknowledge(&self, seq: u64, revision: u64, content: &str, mounted: bool) {
        let mut st = self.state.lock();
        if !mounted {
            // No subscription to wait for; the ack is the confirmation.
            st.pending.remove(&seq);
            if st.last_revision.map_or(true, |r| r < revision) {
                st.last_revision = Some(revision);
                st.confirmed = Some(content.to_string());
            }
        } else if st.pending.contains_key(&seq) {
            if st.last_revision.is_some_and(|r| r >= revision) {
                // Its echo was already passed by a newer update.
                st.pending.remove(&seq);
            } else {
                st.pending.insert(seq, Some(revision));
            }
        }
        if st.pending.is_empty() && st.status == SyncStatus::Syncing {
            st.settle();
        }
        self.publish(&st);
    }

    fn abandon(&self, seq: u64, failure: Option<FailurePolicy>) {
        let mut st = self.state.lock();
        st.pending.remove(&seq);
        if st.pending.is_empty() {
            match failure {
                Some(FailurePolicy::Revert) => {
                    st.text = st.confirmed.clone().unwrap_or_default();
                    st.status = SyncStatus::Failed;
                }
                Some(FailurePolicy::Keep) => {}
                None if st.status == SyncStatus::Syncing => st.settle(),
                None => {}
            }
        }
        self.publish(&st);
    }

    /// The change handler. Returns how the update was treated and whether
    /// the caller should create the missing session.
    fn handle_update(&self, update: SessionUpdate) -> (Applied, bool) {
        let mut st = self.state.lock();
        st.deliveries += 1;

        let Some(snapshot) = update.snapshot else {
            let bootstrap = !st.bootstrapped;
            st.bootstrapped = true;
            st.confirmed = Some(String::new());
            if st.pending.is_empty() {
                st.text.clear();
                st.status = SyncStatus::Connected;
            }
            self.publish(&st);
            return (Applied::Absent, bootstrap);
        };

        if st.last_revision.is_some_and(|r| snapshot.revision <= r) {
            self.publish(&st);
            return (Applied::Stale, false);
        }
        st.last_revision = Some(snapshot.revision);
        st.bootstrapped = true;

        let own_seq = snapshot
            .origin
            .filter(|tag| tag.is_from(self.client_id))
            .map(|tag| tag.seq)
            .filter(|seq| st.pending.contains_key(seq));
        if let Some(seq) = own_seq {
            // Earlier outstanding writes landed before this one.
            st.pending.retain(|&s, _| s > seq);
        }
        let revision = snapshot.revision;
        st.pending
            .retain(|_, acked| acked.map_or(true, |rev| rev > revision));
        st.confirmed = Some(snapshot.content);

        let applied = if own_seq.is_some() {
            Applied::Echo
        } else if !st.pending.is_empty() {
            Applied::Deferred
        } else {
            Applied::Replaced
        };

        if st.pending.is_empty() {
            st.settle();
        } else {
            st.status = SyncStatus::Syncing;
        }
        self.publish(&st);
        (applied, false)
    }

    fn disconnected(&self) {
        let mut st = self.state.lock();
        st.status = SyncStatus::Disconnected;
        self.publish(&st);
    }
}

/// Keeps one session's text in sync with a store for one UI instance.
pub struct SessionSynchronizer<S: SessionStore + ?Sized + 'static> {
    store: Arc<S>,
    session: SessionId,
    options: SyncOptions,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SessionStore + ?Sized + 'static> SessionSynchronizer<S> {
    pub fn new(store: Arc<S>, session: SessionId, options: SyncOptions) -> Self {
        Self::with_client_id(store, session, options, Uuid::new_v4())
    }

    pub fn with_client_id(
        store: Arc<S>,
        session: SessionId,
        options: SyncOptions,
        client_id: Uuid,
    ) -> Self {
        Self {
            store,
            session,
            options,
            shared: Arc::new(Shared::new(client_id)),
            task: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn view(&self) -> SyncView {
        self.shared.view.borrow().clone()
    }

    /// Receiver that observes every published view.
    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.shared.view.subscribe()
    }

    pub fn text(&self) -> String {
        self.shared.state.lock().text.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.state.lock().status
    }

    /// Number of local writes not yet confirmed by the store.
    pub fn pending_writes(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_mounted(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Subscribe to the session and start applying its updates.
    pub async fn mount(&self) -> Result<()> {
        if self.task.lock().is_some() {
            bail!("synchronizer for {} is already mounted", self.session);
        }

        let subscription = self
            .store
            .subscribe(&self.session)
            .await
            .with_context(|| format!("subscribing to session {}", self.session))?;

        let mut task = self.task.lock();
        if task.is_some() {
            bail!("synchronizer for {} is already mounted", self.session);
        }
        self.shared.reset_for_mount();
        *task = Some(tokio::spawn(drive(
            self.shared.clone(),
            self.store.clone(),
            self.session.clone(),
            subscription,
        )));
        tracing::debug!(
            session = %self.session,
            client_id = %self.shared.client_id,
            store = self.store.kind(),
            "mounted"
        );
        Ok(())
    }

    /// Release the subscription. No update is applied once this returns.
    pub async fn unmount(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            tracing::debug!(session = %self.session, "unmounted");
        }
    }

    /// A user edit: shown immediately, then written through the store.
    pub async fn edit(&self, text: impl Into<String>) -> WriteOutcome {
        let text = text.into();
        let tag = self.shared.begin_edit(text.clone());

        let store = &self.store;
        let session = &self.session;
        let shared = &self.shared;
        let result = with_retry(&self.options.retry, |_| {
            let content = text.clone();
            async move {
                if shared.is_superseded(tag.seq) {
                    return Err(anyhow::Error::new(Superseded));
                }
                store.write(session, content, Some(tag)).await
            }
        })
        .await;

        match result {
            Ok(snapshot) => {
                self.shared.acknowledge(
                    tag.seq,
                    snapshot.revision,
                    &snapshot.content,
                    self.is_mounted(),
                );
                WriteOutcome::Acknowledged {
                    revision: snapshot.revision,
                }
            }
            Err(err) if categorize_error(&err) == ErrorCategory::Superseded => {
                tracing::debug!(session = %self.session, seq = tag.seq, "write superseded");
                self.shared.abandon(tag.seq, None);
                WriteOutcome::Superseded
            }
            Err(err) => {
                tracing::error!(
                    session = %self.session,
                    seq = tag.seq,
                    "error updating session: {err:#}"
                );
                self.shared.abandon(tag.seq, Some(self.options.on_failure));
                WriteOutcome::Failed {
                    error: format!("{err:#}"),
                }
            }
        }
    }

    /// Replace the text with clipboard contents.
    pub async fn paste(&self, text: impl Into<String>) -> WriteOutcome {
        self.edit(text).await
    }

    pub async fn clear(&self) -> WriteOutcome {
        self.edit(String::new()).await
    }

    /// Text to put on the clipboard.
    pub fn copy(&self) -> String {
        self.text()
    }
}

impl<S: SessionStore + ?Sized + 'static> Drop for SessionSynchronizer<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn drive<S: SessionStore + ?Sized + 'static>(
    shared: Arc<Shared>,
    store: Arc<S>,
    session: SessionId,
    mut subscription: Subscription,
) {
    while let Some(update) = subscription.next().await {
        let (applied, bootstrap) = shared.handle_update(update);
        tracing::trace!(session = %session, ?applied, "update handled");

        if bootstrap {
            match store.write_if_absent(&session, String::new()).await {
                Ok(Some(_)) => tracing::info!(session = %session, "initialized empty session"),
                Ok(None) => tracing::debug!(session = %session, "session created concurrently"),
                Err(err) => {
                    tracing::error!(session = %session, "error initializing session: {err:#}");
                }
            }
        }
    }

    tracing::warn!(session = %session, "session subscription ended");
    shared.disconnected();
}
