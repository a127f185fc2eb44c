use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::session::{SessionId, SessionSnapshot};
use crate::store::{MemoryStore, SessionStore, SqliteStore};
use crate::sync::SyncMessage;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub name: String,
}

impl AppState {
    pub fn new(store: Arc<dyn SessionStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn SessionStore>> {
    if config.memory {
        tracing::warn!("using in-memory session store; contents are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::open(&config.db)?.with_history_keep(config.history_keep);
    tracing::info!(
        db = %config.db.display(),
        keep = config.history_keep,
        "session database ready"
    );
    Ok(Arc::new(store))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(|| async { Json("OK") }))
        .route("/sessions/{id}", get(get_session).put(put_session))
        .route("/sessions/{id}/history", get(get_history))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: &ServerConfig) -> Result<()> {
    let store = open_store(config)?;
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("server running at http://{addr}");

    run(listener, AppState::new(store, config.name.clone()), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
}

pub async fn run(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn banner(State(state): State<AppState>) -> String {
    format!("{} Session Server", state.name)
}

fn internal_error(err: anyhow::Error) -> StatusCode {
    tracing::error!("{err:#}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    match state.store.read(&id).await.map_err(internal_error)? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
struct PutBody {
    content: String,
}

async fn put_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<PutBody>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    state
        .store
        .write(&id, body.content, None)
        .await
        .map(Json)
        .map_err(internal_error)
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SessionSnapshot>>, StatusCode> {
    let limit = query.limit.unwrap_or(50);
    match state.store.history(&id, limit).await.map_err(internal_error)? {
        Some(entries) => Ok(Json(entries)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (queue, mut queue_rx) = mpsc::unbounded_channel::<SyncMessage>();

    // Send handshake immediately with server metadata
    let _ = queue.send(SyncMessage::welcome(state.name.clone()));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            let text = match msg.to_text() {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("{err:#}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        state,
        queue,
        subscriptions: HashMap::new(),
        peer: None,
    };

    while let Some(msg) = receiver.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => SyncMessage::from_text(text.as_str()),
            Ok(Message::Binary(bin)) => SyncMessage::from_cbor(&bin),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(_) => break,
        };
        match decoded {
            Ok(msg) => connection.handle(msg).await,
            Err(err) => {
                tracing::warn!(peer = ?connection.peer, "ignoring malformed frame: {err:#}");
            }
        }
    }

    connection.close();
    let _ = send_task.await;
}

/// Per-socket state: the subscriptions this client holds.
struct Connection {
    state: AppState,
    queue: mpsc::UnboundedSender<SyncMessage>,
    subscriptions: HashMap<u64, JoinHandle<()>>,
    peer: Option<String>,
}

impl Connection {
    async fn handle(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Hello { client_id, label } => {
                tracing::info!(%client_id, %label, "peer handshake");
                self.peer = Some(label);
            }
            SyncMessage::Subscribe { sub_id, session } => self.subscribe(sub_id, session).await,
            SyncMessage::Unsubscribe { sub_id } => {
                if let Some(task) = self.subscriptions.remove(&sub_id) {
                    task.abort();
                }
            }
            SyncMessage::Read {
                request_id,
                session,
            } => {
                let result = self.state.store.read(&session).await;
                self.reply(request_id, result);
            }
            SyncMessage::Write {
                request_id,
                session,
                content,
                origin,
            } => {
                let result = self.state.store.write(&session, content, origin).await;
                self.reply(request_id, result.map(Some));
            }
            SyncMessage::WriteIfAbsent {
                request_id,
                session,
                content,
            } => {
                let result = self.state.store.write_if_absent(&session, content).await;
                self.reply(request_id, result);
            }
            SyncMessage::History {
                request_id,
                session,
                limit,
            } => {
                let msg = match self.state.store.history(&session, limit).await {
                    Ok(entries) => SyncMessage::HistoryResult {
                        request_id,
                        entries,
                    },
                    Err(err) => SyncMessage::Nack {
                        request_id,
                        error: format!("{err:#}"),
                    },
                };
                let _ = self.queue.send(msg);
            }
            other => tracing::warn!(peer = ?self.peer, ?other, "unexpected message from client"),
        }
    }

    async fn subscribe(&mut self, sub_id: u64, session: SessionId) {
        let mut subscription = match self.state.store.subscribe(&session).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::error!(%session, "error subscribing: {err:#}");
                let _ = self.queue.send(SyncMessage::Nack {
                    request_id: sub_id,
                    error: format!("{err:#}"),
                });
                return;
            }
        };

        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            while let Some(update) = subscription.next().await {
                if queue.send(SyncMessage::update(sub_id, update)).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.subscriptions.insert(sub_id, task) {
            previous.abort();
        }
    }

    fn reply(&self, request_id: u64, result: Result<Option<SessionSnapshot>>) {
        let msg = match result {
            Ok(snapshot) => SyncMessage::Ack {
                request_id,
                snapshot,
            },
            Err(err) => {
                tracing::error!(request_id, "store request failed: {err:#}");
                SyncMessage::Nack {
                    request_id,
                    error: format!("{err:#}"),
                }
            }
        };
        let _ = self.queue.send(msg);
    }

    fn close(self) {
        for (_, task) in self.subscriptions {
            task.abort();
        }
        tracing::debug!(peer = ?self.peer, "connection closed");
    }
}
