pub mod api;

use anyhow::Result;

use crate::config::ServerConfig;

pub use api::{open_store, router, run, AppState};

pub async fn start(config: &ServerConfig) -> Result<()> {
    api::serve(config).await
}
