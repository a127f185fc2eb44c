//! Real-time sync: the wire protocol spoken by the server and the remote
//! store, and the synchronizer that binds one UI instance to a session.

pub mod protocol;
pub mod synchronizer;

pub use protocol::SyncMessage;
pub use synchronizer::{
    Applied, FailurePolicy, SessionSynchronizer, SyncOptions, SyncStatus, SyncView, WriteOutcome,
};
