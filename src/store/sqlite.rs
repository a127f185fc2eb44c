use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Fanout, SessionStore, Subscription};
use crate::session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};

/// Number of past writes kept per session in the `updates` table.
pub const DEFAULT_HISTORY_KEEP: u64 = 100;

struct Inner {
    conn: Mutex<Connection>,
    fanout: Fanout,
    history_keep: u64,
}

/// SQLite-backed store. Survives restarts and keeps a short write history.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening session database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                fanout: Fanout::default(),
                history_keep: DEFAULT_HISTORY_KEEP,
            }),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn with_history_keep(self, keep: u64) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Self {
                inner: Arc::new(Inner {
                    history_keep: keep.max(1),
                    ..inner
                }),
            },
            Err(inner) => Self { inner },
        }
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.inner.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                revision INTEGER NOT NULL,
                origin TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS updates (
                session_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                content TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                origin TEXT,
                PRIMARY KEY (session_id, revision)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_updates_session_time
             ON updates(session_id, last_updated)",
            [],
        )?;

        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|err| anyhow!("failed to join database task: {err}"))?
    }
}

impl Inner {
    fn current(conn: &Connection, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        conn.query_row(
            "SELECT content, last_updated, revision, origin FROM sessions WHERE id = ?1",
            params![id.as_str()],
            snapshot_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    fn store(
        &self,
        conn: &mut Connection,
        id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<()> {
        let origin = snapshot.origin.map(|o| serde_json::to_string(&o)).transpose()?;
        let last_updated = snapshot.last_updated.to_rfc3339();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (id, content, last_updated, revision, origin)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                last_updated = excluded.last_updated,
                revision = excluded.revision,
                origin = excluded.origin",
            params![
                id.as_str(),
                snapshot.content,
                last_updated,
                snapshot.revision as i64,
                origin,
            ],
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO updates (session_id, revision, content, last_updated, origin)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                snapshot.revision as i64,
                snapshot.content,
                last_updated,
                origin,
            ],
        )?;

        tx.execute(
            "DELETE FROM updates WHERE session_id = ?1 AND revision <= ?2",
            params![
                id.as_str(),
                snapshot.revision as i64 - self.history_keep as i64
            ],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSnapshot> {
    let content: String = row.get(0)?;
    let last_updated: String = row.get(1)?;
    let revision: i64 = row.get(2)?;
    let origin: Option<String> = row.get(3)?;

    let last_updated = DateTime::parse_from_rfc3339(&last_updated)
        .map_err(|e| conversion_error(1, e))?
        .with_timezone(&Utc);
    let origin = origin
        .map(|o| serde_json::from_str::<WriteTag>(&o))
        .transpose()
        .map_err(|e| conversion_error(3, e))?;

    Ok(SessionSnapshot {
        content,
        last_updated,
        revision: revision as u64,
        origin,
    })
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        let id = id.clone();
        self.blocking(move |inner| Inner::current(&inner.conn.lock(), &id))
            .await
    }

    async fn write(
        &self,
        id: &SessionId,
        content: String,
        origin: Option<WriteTag>,
    ) -> Result<SessionSnapshot> {
        let id = id.clone();
        self.blocking(move |inner| {
            let mut conn = inner.conn.lock();
            let previous = Inner::current(&conn, &id)?;
            let snapshot = SessionSnapshot::next(previous.as_ref(), content, origin);
            inner.store(&mut conn, &id, &snapshot)?;
            inner
                .fanout
                .publish(SessionUpdate::new(id.clone(), Some(snapshot.clone())));
            tracing::debug!(session = %id, revision = snapshot.revision, "session written");
            Ok(snapshot)
        })
        .await
    }

    async fn write_if_absent(
        &self,
        id: &SessionId,
        content: String,
    ) -> Result<Option<SessionSnapshot>> {
        let id = id.clone();
        self.blocking(move |inner| {
            let mut conn = inner.conn.lock();
            if Inner::current(&conn, &id)?.is_some() {
                return Ok(None);
            }
            let snapshot = SessionSnapshot::next(None, content, None);
            inner.store(&mut conn, &id, &snapshot)?;
            inner
                .fanout
                .publish(SessionUpdate::new(id.clone(), Some(snapshot.clone())));
            tracing::info!(session = %id, "session created");
            Ok(Some(snapshot))
        })
        .await
    }

    async fn subscribe(&self, id: &SessionId) -> Result<Subscription> {
        let id = id.clone();
        self.blocking(move |inner| {
            let conn = inner.conn.lock();
            let current = Inner::current(&conn, &id)?;
            Ok(inner.fanout.subscribe(&id, current))
        })
        .await
    }

    fn subscriber_count(&self, id: &SessionId) -> usize {
        self.inner.fanout.subscriber_count(id)
    }

    async fn history(
        &self,
        id: &SessionId,
        limit: usize,
    ) -> Result<Option<Vec<SessionSnapshot>>> {
        let id = id.clone();
        self.blocking(move |inner| {
            let conn = inner.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT content, last_updated, revision, origin
                 FROM updates
                 WHERE session_id = ?1
                 ORDER BY revision DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![id.as_str(), limit as i64], snapshot_from_row)?;
            Ok(Some(rows.collect::<Result<Vec<_>, _>>()?))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/clipflow.db");
        let id = SessionId::global();
        let tag = WriteTag::new(Uuid::new_v4(), 7);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.write(&id, "first".into(), None).await.unwrap();
            store.write(&id, "second".into(), Some(tag)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let snapshot = store.read(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.content, "second");
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.origin, Some(tag));
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_trimmed() {
        let store = SqliteStore::open_in_memory().unwrap().with_history_keep(2);
        let id = SessionId::global();
        for text in ["a", "b", "c"] {
            store.write(&id, text.into(), None).await.unwrap();
        }

        let history = store.history(&id, 10).await.unwrap().unwrap();
        let contents: Vec<_> = history.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_subscribe_sees_absent_then_created() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = SessionId::global();
        let mut sub = store.subscribe(&id).await.unwrap();
        assert_eq!(sub.next().await.unwrap().snapshot, None);

        assert!(store.write_if_absent(&id, String::new()).await.unwrap().is_some());
        assert_eq!(sub.next().await.unwrap().content(), Some(""));
        assert!(store.write_if_absent(&id, "late".into()).await.unwrap().is_none());
    }
}
