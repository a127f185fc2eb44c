use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use super::{SessionStore, Subscription};
use crate::session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};
use crate::sync::SyncMessage;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

enum Reply {
    Ack(Option<SessionSnapshot>),
    History(Option<Vec<SessionSnapshot>>),
    Nack(String),
}

struct Route {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionUpdate>,
}

struct Inner {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    routes: DashMap<u64, Route>,
    connected: AtomicBool,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, msg: SyncMessage) {
        match msg {
            SyncMessage::Welcome { server, version } => {
                tracing::info!(%server, %version, "connected to session server");
            }
            SyncMessage::Update {
                sub_id,
                session,
                snapshot,
            } => {
                let delivered = match self.routes.get(&sub_id) {
                    Some(route) => route.tx.send(SessionUpdate::new(session, snapshot)).is_ok(),
                    None => false,
                };
                if !delivered {
                    self.routes.remove(&sub_id);
                }
            }
            SyncMessage::Ack {
                request_id,
                snapshot,
            } => self.reply(request_id, Reply::Ack(snapshot)),
            SyncMessage::HistoryResult {
                request_id,
                entries,
            } => self.reply(request_id, Reply::History(entries)),
            SyncMessage::Nack { request_id, error } => {
                // Subscription ids share the request id space.
                match self.routes.remove(&request_id) {
                    Some((_, route)) => {
                        tracing::warn!(session = %route.session, "subscription rejected: {error}");
                    }
                    None => self.reply(request_id, Reply::Nack(error)),
                }
            }
            other => tracing::warn!(?other, "unexpected message from server"),
        }
    }

    fn reply(&self, request_id: u64, reply: Reply) {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(request_id, "reply for unknown or expired request"),
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every waiter and ends every stream.
        self.pending.clear();
        self.routes.clear();
    }
}

/// Session store living on a ClipFlow server, reached over one websocket.
pub struct RemoteStore {
    client_id: Uuid,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    inner: Arc<Inner>,
    request_timeout: Duration,
    forward: JoinHandle<()>,
    recv: JoinHandle<()>,
}

impl RemoteStore {
    pub async fn connect(url: &str, label: String, request_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| anyhow!("invalid ws url: {e}"))?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("websocket connection to {url} failed"))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<SyncMessage>();
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            routes: DashMap::new(),
            connected: AtomicBool::new(true),
        });
        let client_id = Uuid::new_v4();

        // local -> remote
        let forward = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!("{err:#}");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // remote -> local
        let inner_recv = inner.clone();
        let recv = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => SyncMessage::from_text(text.as_str()),
                    Ok(Message::Binary(bin)) => SyncMessage::from_cbor(&bin),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                    Err(err) => {
                        tracing::warn!("websocket error: {err}");
                        break;
                    }
                };
                match decoded {
                    Ok(msg) => inner_recv.dispatch(msg),
                    Err(err) => tracing::warn!("ignoring malformed frame: {err:#}"),
                }
            }
            tracing::warn!("session server connection closed");
            inner_recv.disconnect();
        });

        let store = Self {
            client_id,
            outgoing,
            inner,
            request_timeout,
            forward,
            recv,
        };
        store.send(SyncMessage::Hello { client_id, label })?;
        Ok(store)
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Drop the socket. Pending requests fail and subscription streams end.
    pub fn close(&self) {
        self.forward.abort();
        self.recv.abort();
        self.inner.disconnect();
    }

    fn send(&self, msg: SyncMessage) -> Result<()> {
        if !self.is_connected() {
            bail!("websocket disconnected");
        }
        self.outgoing
            .send(msg)
            .map_err(|_| anyhow!("websocket disconnected"))
    }

    async fn request(&self, build: impl FnOnce(u64) -> SyncMessage) -> Result<Reply> {
        let request_id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);
        if let Err(err) = self.send(build(request_id)) {
            self.inner.pending.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Reply::Nack(error))) => Err(anyhow!("server error: {error}")),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(anyhow!("websocket disconnected before reply")),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                Err(anyhow!("request timed out after {:?}", self.request_timeout))
            }
        }
    }

    async fn request_snapshot(
        &self,
        build: impl FnOnce(u64) -> SyncMessage,
    ) -> Result<Option<SessionSnapshot>> {
        match self.request(build).await? {
            Reply::Ack(snapshot) => Ok(snapshot),
            _ => Err(anyhow!("unexpected reply kind")),
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.forward.abort();
        self.recv.abort();
    }
}

#[async_trait]
impl SessionStore for RemoteStore {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn read(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        self.request_snapshot(|request_id| SyncMessage::Read {
            request_id,
            session: id.clone(),
        })
        .await
    }

    async fn write(
        &self,
        id: &SessionId,
        content: String,
        origin: Option<WriteTag>,
    ) -> Result<SessionSnapshot> {
        self.request_snapshot(|request_id| SyncMessage::Write {
            request_id,
            session: id.clone(),
            content,
            origin,
        })
        .await?
        .ok_or_else(|| anyhow!("server acknowledged write without a snapshot"))
    }

    async fn write_if_absent(
        &self,
        id: &SessionId,
        content: String,
    ) -> Result<Option<SessionSnapshot>> {
        self.request_snapshot(|request_id| SyncMessage::WriteIfAbsent {
            request_id,
            session: id.clone(),
            content,
        })
        .await
    }

    async fn subscribe(&self, id: &SessionId) -> Result<Subscription> {
        let sub_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.insert(
            sub_id,
            Route {
                session: id.clone(),
                tx,
            },
        );
        if let Err(err) = self.send(SyncMessage::Subscribe {
            sub_id,
            session: id.clone(),
        }) {
            self.inner.routes.remove(&sub_id);
            return Err(err);
        }

        let inner = self.inner.clone();
        let outgoing = self.outgoing.clone();
        Ok(Subscription::new(id.clone(), UnboundedReceiverStream::new(rx)).on_release(move || {
            inner.routes.remove(&sub_id);
            let _ = outgoing.send(SyncMessage::Unsubscribe { sub_id });
        }))
    }

    fn subscriber_count(&self, id: &SessionId) -> usize {
        self.inner
            .routes
            .iter()
            .filter(|route| route.session == *id)
            .count()
    }

    async fn history(
        &self,
        id: &SessionId,
        limit: usize,
    ) -> Result<Option<Vec<SessionSnapshot>>> {
        match self
            .request(|request_id| SyncMessage::History {
                request_id,
                session: id.clone(),
                limit,
            })
            .await?
        {
            Reply::History(entries) => Ok(entries),
            _ => Err(anyhow!("unexpected reply kind")),
        }
    }
}
