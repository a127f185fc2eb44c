//! Wire protocol spoken over the `/ws` endpoint.
//!
//! Messages are JSON in text frames, tagged by `type`. Binary frames
//! carry the same enum encoded as CBOR.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    // client -> server
    Hello {
        client_id: Uuid,
        label: String,
    },
    Subscribe {
        sub_id: u64,
        session: SessionId,
    },
    Unsubscribe {
        sub_id: u64,
    },
    Read {
        request_id: u64,
        session: SessionId,
    },
    Write {
        request_id: u64,
        session: SessionId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<WriteTag>,
    },
    WriteIfAbsent {
        request_id: u64,
        session: SessionId,
        content: String,
    },
    History {
        request_id: u64,
        session: SessionId,
        limit: usize,
    },

    // server -> client
    Welcome {
        server: String,
        version: String,
    },
    Update {
        sub_id: u64,
        session: SessionId,
        snapshot: Option<SessionSnapshot>,
    },
    Ack {
        request_id: u64,
        snapshot: Option<SessionSnapshot>,
    },
    HistoryResult {
        request_id: u64,
        entries: Option<Vec<SessionSnapshot>>,
    },
    /// Failed request. A `Subscribe` that could not be served is answered
    /// with its `sub_id` in `request_id`.
    Nack {
        request_id: u64,
        error: String,
    },
}

impl SyncMessage {
    pub fn welcome(server: impl Into<String>) -> Self {
        Self::Welcome {
            server: server.into(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn update(sub_id: u64, update: SessionUpdate) -> Self {
        Self::Update {
            sub_id,
            session: update.session,
            snapshot: update.snapshot,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding sync message")
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("decoding sync message")
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).context("encoding sync message as cbor")
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes).context("decoding cbor sync message")
    }
}
