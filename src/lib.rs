//! # ClipFlow - Shared Clipboard
//!
//! One text document per session, mirrored in real time across every
//! connected client.
//!
//! ## Features
//!
//! - **Echo suppression**: local writes are tagged so their round-tripped
//!   updates never disturb what the user just typed
//! - **Pluggable stores**: in-memory, SQLite, or a remote ClipFlow server
//! - **WebSocket server**: hosts any store for browsers and terminals
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clipflow::{MemoryStore, SessionId, SessionSynchronizer, SyncOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let sync = SessionSynchronizer::new(store, SessionId::global(), SyncOptions::default());
//!     sync.mount().await?;
//!     sync.edit("hello").await;
//!     println!("{}", sync.copy());
//!     sync.unmount().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;

// Re-export main types for library consumers
pub use config::ClipConfig;
pub use session::{SessionId, SessionSnapshot, SessionUpdate, WriteTag};
pub use store::{MemoryStore, RemoteStore, SessionStore, SqliteStore, Subscription};
pub use sync::{SessionSynchronizer, SyncOptions, SyncStatus, SyncView, WriteOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
