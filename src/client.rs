//! One-shot REST access to a session server, for non-interactive use.

use anyhow::{anyhow, Context as _, Result};
use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use crate::session::{SessionId, SessionSnapshot};

#[derive(Clone)]
pub struct HttpClient {
    base: Url,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct PutBody<'a> {
    content: &'a str,
}

impl HttpClient {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn session_url(&self, id: &SessionId) -> Result<Url> {
        self.base
            .join(&format!("sessions/{id}"))
            .map_err(|e| anyhow!("invalid session url: {e}"))
    }

    pub async fn get(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        let response = self
            .http
            .get(self.session_url(id)?)
            .send()
            .await
            .context("connection to session server failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let snapshot = response
            .error_for_status()?
            .json::<SessionSnapshot>()
            .await
            .context("decoding session snapshot")?;
        Ok(Some(snapshot))
    }

    pub async fn put(&self, id: &SessionId, content: &str) -> Result<SessionSnapshot> {
        self.http
            .put(self.session_url(id)?)
            .json(&PutBody { content })
            .send()
            .await
            .context("connection to session server failed")?
            .error_for_status()?
            .json::<SessionSnapshot>()
            .await
            .context("decoding session snapshot")
    }
}
