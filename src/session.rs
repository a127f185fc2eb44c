//! Session data model shared by the stores, the wire protocol and the
//! synchronizer.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known id of the session every client shares by default.
pub const GLOBAL_SESSION: &str = "global-session";

const MAX_ID_LEN: usize = 128;

/// Identifier of one shared document.
///
/// Ids are restricted to `[A-Za-z0-9_.-]` so they can be embedded in URL
/// paths and SQL parameters without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            bail!("invalid session id: empty");
        }
        if id.len() > MAX_ID_LEN {
            bail!("invalid session id: longer than {MAX_ID_LEN} bytes");
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            bail!("invalid session id {id:?}: unexpected character {c:?}");
        }
        Ok(Self(id))
    }

    /// The single shared session.
    pub fn global() -> Self {
        Self(GLOBAL_SESSION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Identifies one local write so its echo can be recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteTag {
    pub client_id: Uuid,
    /// Strictly increasing per synchronizer, starting at 1.
    pub seq: u64,
}

impl WriteTag {
    pub fn new(client_id: Uuid, seq: u64) -> Self {
        Self { client_id, seq }
    }

    pub fn is_from(&self, client_id: Uuid) -> bool {
        self.client_id == client_id
    }
}

/// Current value of a session as held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub content: String,
    /// Server-assigned, bookkeeping only.
    pub last_updated: DateTime<Utc>,
    /// Increases by one on every accepted write; the first write is 1.
    pub revision: u64,
    /// Tag of the write that produced this value, if the writer sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<WriteTag>,
}

impl SessionSnapshot {
    /// Snapshot that follows `previous` (or starts a new session).
    pub fn next(
        previous: Option<&SessionSnapshot>,
        content: String,
        origin: Option<WriteTag>,
    ) -> Self {
        Self {
            content,
            last_updated: Utc::now(),
            revision: previous.map_or(1, |p| p.revision + 1),
            origin,
        }
    }
}

/// One item of a subscription: the session's value after a change, or
/// `None` when the session does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub session: SessionId,
    pub snapshot: Option<SessionSnapshot>,
}

impl SessionUpdate {
    pub fn new(session: SessionId, snapshot: Option<SessionSnapshot>) -> Self {
        Self { session, snapshot }
    }

    pub fn content(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.content.as_str())
    }
}
