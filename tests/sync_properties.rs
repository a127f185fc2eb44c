use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clipflow::error::RetryPolicy;
use clipflow::session::{SessionId, SessionSnapshot, WriteTag};
use clipflow::store::{MemoryStore, SessionStore, Subscription};
use clipflow::sync::{
    FailurePolicy, SessionSynchronizer, SyncOptions, SyncStatus, SyncView, WriteOutcome,
};
use tokio::time::{sleep, timeout};

async fn wait_view<S: SessionStore + ?Sized + 'static>(
    sync: &SessionSynchronizer<S>,
    pred: impl Fn(&SyncView) -> bool,
) -> SyncView {
    let mut rx = sync.watch();
    let view = timeout(Duration::from_secs(5), rx.wait_for(|v| pred(v)))
        .await
        .expect("timed out waiting for view")
        .expect("view channel closed")
        .clone();
    view
}

async fn mounted(store: Arc<MemoryStore>, id: &SessionId) -> SessionSynchronizer<MemoryStore> {
    let sync = SessionSynchronizer::new(store, id.clone(), SyncOptions::default());
    sync.mount().await.unwrap();
    wait_view(&sync, |v| v.deliveries >= 1).await;
    sync
}

async fn seeded(content: &str) -> (Arc<MemoryStore>, SessionId) {
    let store = Arc::new(MemoryStore::new());
    let id = SessionId::global();
    store.write(&id, content.to_string(), None).await.unwrap();
    (store, id)
}

#[tokio::test]
async fn fresh_client_sees_last_write() {
    for text in ["", "plain", "multi\nline\ttext", "ünïcödé ✓"] {
        let (store, id) = seeded(text).await;
        let sync = mounted(store, &id).await;
        assert_eq!(sync.view().text, text);
        assert_eq!(sync.status(), SyncStatus::Connected);
    }
}

#[tokio::test]
async fn own_echo_is_consumed_and_remote_update_still_applies() {
    let (store, id) = seeded("").await;
    let sync = mounted(store.clone(), &id).await;

    let outcome = sync.edit("typed locally").await;
    assert!(matches!(outcome, WriteOutcome::Acknowledged { revision: 2 }));
    assert_eq!(sync.text(), "typed locally");

    let view = wait_view(&sync, |v| v.revision == Some(2)).await;
    assert_eq!(view.text, "typed locally");
    assert_eq!(view.status, SyncStatus::Connected);
    assert_eq!(sync.pending_writes(), 0);

    store.write(&id, "from another client".into(), None).await.unwrap();
    let view = wait_view(&sync, |v| v.revision == Some(3)).await;
    assert_eq!(view.text, "from another client");
}

#[tokio::test]
async fn absent_session_is_bootstrapped_empty() {
    let store = Arc::new(MemoryStore::new());
    let id = SessionId::new("brand-new").unwrap();
    let sync = SessionSynchronizer::new(store.clone(), id.clone(), SyncOptions::default());
    sync.mount().await.unwrap();

    let view = wait_view(&sync, |v| v.deliveries >= 1).await;
    assert_eq!(view.text, "");
    assert_eq!(view.status, SyncStatus::Connected);

    // The initializing write comes back through the subscription.
    let view = wait_view(&sync, |v| v.revision == Some(1)).await;
    assert_eq!(view.text, "");
    let stored = store.read(&id).await.unwrap().expect("session created");
    assert_eq!(stored.content, "");
}

#[tokio::test]
async fn bootstrap_does_not_clobber_concurrent_creation() {
    let store = Arc::new(MemoryStore::new());
    let id = SessionId::global();
    let sync = SessionSynchronizer::new(store.clone(), id.clone(), SyncOptions::default());
    sync.mount().await.unwrap();
    store.write(&id, "first!".into(), None).await.unwrap();

    let view = wait_view(&sync, |v| v.text == "first!").await;
    assert_eq!(view.status, SyncStatus::Connected);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(store.read(&id).await.unwrap().unwrap().content, "first!");
}

#[tokio::test]
async fn unmount_stops_delivery() {
    let (store, id) = seeded("before").await;
    let sync = mounted(store.clone(), &id).await;
    assert_eq!(store.subscriber_count(&id), 1);

    sync.unmount().await;
    assert!(!sync.is_mounted());
    assert_eq!(store.subscriber_count(&id), 0);

    let deliveries = sync.view().deliveries;
    store.write(&id, "after".into(), None).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(sync.view().deliveries, deliveries);
    assert_eq!(sync.text(), "before");
}

#[tokio::test]
async fn mount_twice_is_rejected() {
    let (store, id) = seeded("").await;
    let sync = mounted(store, &id).await;
    assert!(sync.mount().await.is_err());
}

#[tokio::test]
async fn two_clients_converge() {
    let (store, id) = seeded("").await;
    let a = mounted(store.clone(), &id).await;
    let b = mounted(store.clone(), &id).await;

    a.edit("hello").await;
    assert_eq!(wait_view(&b, |v| v.text == "hello").await.status, SyncStatus::Connected);

    a.edit("hello world").await;
    wait_view(&b, |v| v.text == "hello world").await;

    b.edit("hello world!").await;
    let view = wait_view(&a, |v| v.text == "hello world!").await;
    assert_eq!(view.status, SyncStatus::Connected);
    assert_eq!(a.pending_writes(), 0);
    let view = wait_view(&b, |v| v.status == SyncStatus::Connected).await;
    assert_eq!(view.text, "hello world!");
}

#[tokio::test]
async fn rapid_edits_before_echo_keep_latest_text() {
    let (store, id) = seeded("").await;
    let sync = mounted(store.clone(), &id).await;

    sync.edit("a").await;
    sync.edit("ab").await;
    assert_eq!(sync.text(), "ab");

    // Both echoes are consumed; neither shows "a" again or leaves a tag behind.
    let view = wait_view(&sync, |v| v.revision == Some(3)).await;
    assert_eq!(view.text, "ab");
    assert_eq!(view.status, SyncStatus::Connected);
    assert_eq!(sync.pending_writes(), 0);

    store.write(&id, "remote".into(), None).await.unwrap();
    assert_eq!(wait_view(&sync, |v| v.revision == Some(4)).await.text, "remote");
}

#[tokio::test]
async fn foreign_write_between_rapid_edits_is_overwritten() {
    let (store, id) = seeded("").await;
    let sync = mounted(store.clone(), &id).await;

    sync.edit("a").await;
    store.write(&id, "X".into(), None).await.unwrap();
    sync.edit("ab").await;

    let view = wait_view(&sync, |v| v.revision == Some(4)).await;
    assert_eq!(view.text, "ab");
    assert_eq!(store.read(&id).await.unwrap().unwrap().content, "ab");
}

#[tokio::test]
async fn paste_clear_and_copy_use_the_edit_path() {
    let (store, id) = seeded("start").await;
    let sync = mounted(store.clone(), &id).await;

    sync.paste("from clipboard").await;
    assert_eq!(sync.copy(), "from clipboard");
    assert_eq!(store.read(&id).await.unwrap().unwrap().content, "from clipboard");

    sync.clear().await;
    assert_eq!(sync.copy(), "");
    let stored = store.read(&id).await.unwrap().unwrap();
    assert_eq!(stored.content, "");
    assert_eq!(stored.origin.map(|o| o.client_id), Some(sync.client_id()));
}

#[tokio::test]
async fn sessions_do_not_interfere() {
    let store = Arc::new(MemoryStore::new());
    let one = SessionId::new("one").unwrap();
    let two = SessionId::new("two").unwrap();
    store.write(&one, "".into(), None).await.unwrap();
    store.write(&two, "".into(), None).await.unwrap();

    let a = mounted(store.clone(), &one).await;
    let b = mounted(store.clone(), &two).await;
    a.edit("only in one").await;
    wait_view(&a, |v| v.revision == Some(2)).await;

    sleep(Duration::from_millis(20)).await;
    assert_eq!(b.text(), "");
    assert_eq!(b.view().revision, Some(1));
}

/// Memory store whose writes fail while `failures` is above zero.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn read(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        self.inner.read(id).await
    }

    async fn write(
        &self,
        id: &SessionId,
        content: String,
        origin: Option<WriteTag>,
    ) -> Result<SessionSnapshot> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            bail!("connection reset by peer");
        }
        self.inner.write(id, content, origin).await
    }

    async fn write_if_absent(
        &self,
        id: &SessionId,
        content: String,
    ) -> Result<Option<SessionSnapshot>> {
        self.inner.write_if_absent(id, content).await
    }

    async fn subscribe(&self, id: &SessionId) -> Result<Subscription> {
        self.inner.subscribe(id).await
    }

    fn subscriber_count(&self, id: &SessionId) -> usize {
        self.inner.subscriber_count(id)
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn flaky_sync(
    failures: u32,
    options: SyncOptions,
) -> (Arc<FlakyStore>, SessionSynchronizer<FlakyStore>) {
    let store = Arc::new(FlakyStore::new(0));
    let id = SessionId::global();
    store.write(&id, "stored".into(), None).await.unwrap();
    store.failures.store(failures, Ordering::SeqCst);

    let sync = SessionSynchronizer::new(store.clone(), id, options);
    sync.mount().await.unwrap();
    wait_view(&sync, |v| v.deliveries >= 1).await;
    (store, sync)
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let options = SyncOptions {
        retry: fast_retry(3),
        ..Default::default()
    };
    let (store, sync) = flaky_sync(2, options).await;

    let outcome = sync.edit("eventually").await;
    assert_eq!(outcome, WriteOutcome::Acknowledged { revision: 2 });
    wait_view(&sync, |v| v.revision == Some(2)).await;
    assert_eq!(sync.text(), "eventually");
    let id = SessionId::global();
    assert_eq!(store.read(&id).await.unwrap().unwrap().content, "eventually");
}

#[tokio::test]
async fn failed_write_reverts_by_default() {
    let options = SyncOptions {
        retry: fast_retry(2),
        ..Default::default()
    };
    let (_store, sync) = flaky_sync(10, options).await;

    let outcome = sync.edit("lost").await;
    assert!(matches!(outcome, WriteOutcome::Failed { .. }));
    let view = sync.view();
    assert_eq!(view.text, "stored");
    assert_eq!(view.status, SyncStatus::Failed);
    assert_eq!(sync.pending_writes(), 0);
}

#[tokio::test]
async fn failed_write_can_keep_optimistic_text() {
    let options = SyncOptions {
        retry: RetryPolicy::no_retry(),
        on_failure: FailurePolicy::Keep,
    };
    let (store, sync) = flaky_sync(1, options).await;

    let outcome = sync.edit("unsaved").await;
    assert!(matches!(outcome, WriteOutcome::Failed { .. }));
    assert_eq!(sync.text(), "unsaved");
    assert_eq!(sync.status(), SyncStatus::Syncing);

    store.write(&SessionId::global(), "next remote".into(), None).await.unwrap();
    let view = wait_view(&sync, |v| v.status == SyncStatus::Connected).await;
    assert_eq!(view.text, "next remote");
}
