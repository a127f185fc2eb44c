use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clipflow::server::{self, AppState};
use clipflow::session::SessionId;
use clipflow::store::{MemoryStore, SessionStore};
use clipflow::sync::SyncMessage;
use futures::{SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};

async fn start_server(store: Arc<dyn SessionStore>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::run(listener, AppState::new(store, "Test"), std::future::pending()).await;
    });
    addr
}

async fn next_msg<S>(read: &mut S) -> SyncMessage
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(3), read.next())
            .await
            .expect("timed out waiting for server")
            .expect("socket closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return SyncMessage::from_text(text.as_str()).unwrap();
        }
    }
}

fn text(msg: &SyncMessage) -> Message {
    Message::Text(msg.to_text().unwrap().into())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_subscribe_write_roundtrip() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let addr = start_server(store.clone()).await;

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect");
    let (mut write, mut read) = ws.split();

    match next_msg(&mut read).await {
        SyncMessage::Welcome { server, .. } => assert_eq!(server, "Test"),
        other => panic!("expected welcome, got {other:?}"),
    }

    let session = SessionId::global();
    write
        .send(text(&SyncMessage::Subscribe {
            sub_id: 1,
            session: session.clone(),
        }))
        .await
        .unwrap();
    assert_eq!(
        next_msg(&mut read).await,
        SyncMessage::Update {
            sub_id: 1,
            session: session.clone(),
            snapshot: None,
        }
    );

    write
        .send(text(&SyncMessage::Write {
            request_id: 2,
            session: session.clone(),
            content: "x".into(),
            origin: None,
        }))
        .await
        .unwrap();

    // The ack and our own broadcast may arrive in either order.
    let mut got_ack = false;
    let mut got_update = false;
    while !(got_ack && got_update) {
        match next_msg(&mut read).await {
            SyncMessage::Ack {
                request_id: 2,
                snapshot: Some(snapshot),
            } => {
                assert_eq!(snapshot.content, "x");
                got_ack = true;
            }
            SyncMessage::Update {
                sub_id: 1,
                snapshot: Some(snapshot),
                ..
            } => {
                assert_eq!(snapshot.content, "x");
                assert_eq!(snapshot.revision, 1);
                got_update = true;
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(store.read(&session).await.unwrap().unwrap().content, "x");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_ignores_malformed_frames_and_accepts_cbor() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let session = SessionId::global();
    store.write(&session, "seeded".into(), None).await.unwrap();
    let addr = start_server(store).await;

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect");
    let (mut write, mut read) = ws.split();
    assert!(matches!(next_msg(&mut read).await, SyncMessage::Welcome { .. }));

    write.send(Message::Text("not json".into())).await.unwrap();
    write
        .send(Message::Text(r#"{"type":"subscribe","sub_id":1,"session":"../x"}"#.into()))
        .await
        .unwrap();

    let read_req = SyncMessage::Read {
        request_id: 7,
        session: session.clone(),
    };
    write
        .send(Message::Binary(read_req.to_cbor().unwrap().into()))
        .await
        .unwrap();

    match next_msg(&mut read).await {
        SyncMessage::Ack {
            request_id: 7,
            snapshot: Some(snapshot),
        } => assert_eq!(snapshot.content, "seeded"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_broadcasts_between_clients() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let addr = start_server(store.clone()).await;
    let url = format!("ws://{addr}/ws");
    let session = SessionId::global();

    let (ws_a, _) = tokio_tungstenite::connect_async(url.clone()).await.expect("ws A");
    let (ws_b, _) = tokio_tungstenite::connect_async(url.clone()).await.expect("ws B");
    let (mut write_a, mut read_a) = ws_a.split();
    let (mut write_b, mut read_b) = ws_b.split();
    next_msg(&mut read_a).await;
    next_msg(&mut read_b).await;

    write_b
        .send(text(&SyncMessage::Subscribe {
            sub_id: 10,
            session: session.clone(),
        }))
        .await
        .unwrap();
    assert!(matches!(
        next_msg(&mut read_b).await,
        SyncMessage::Update { snapshot: None, .. }
    ));

    write_a
        .send(text(&SyncMessage::Write {
            request_id: 1,
            session: session.clone(),
            content: "from a".into(),
            origin: None,
        }))
        .await
        .unwrap();

    match next_msg(&mut read_b).await {
        SyncMessage::Update {
            sub_id: 10,
            snapshot: Some(snapshot),
            ..
        } => assert_eq!(snapshot.content, "from a"),
        other => panic!("client B expected update, got {other:?}"),
    }

    write_b
        .send(text(&SyncMessage::Unsubscribe { sub_id: 10 }))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while store.subscriber_count(&session) > 0 {
        assert!(tokio::time::Instant::now() < deadline, "subscription not released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
