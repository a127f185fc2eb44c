//! Configuration: `clipflow.toml` (or `--config`), then `.env`/environment
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RetryPolicy;
use crate::session::SessionId;
use crate::store::sqlite::DEFAULT_HISTORY_KEEP;
use crate::sync::{FailurePolicy, SyncOptions};

pub const DEFAULT_CONFIG_FILE: &str = "clipflow.toml";
const DEFAULT_DB_PATH: &str = ".dx/clipflow/clipflow.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// SQLite file; ignored when `memory` is set.
    pub db: PathBuf,
    pub memory: bool,
    /// Past writes kept per session for `/sessions/{id}/history`.
    pub history_keep: u64,
    /// Banner returned by `GET /` and sent in `Welcome`.
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            db: PathBuf::from(DEFAULT_DB_PATH),
            memory: false,
            history_keep: DEFAULT_HISTORY_KEEP,
            name: "ClipFlow".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the server.
    pub url: String,
    pub session: SessionId,
    /// Shown in the server's logs; defaults to the OS username.
    pub label: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            session: SessionId::global(),
            label: None,
            request_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(whoami::username)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// REST base derived from the websocket url: `ws://h:p/ws` -> `http://h:p`.
    pub fn http_base(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).with_context(|| format!("invalid server url {}", self.url))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => return Err(anyhow!("invalid server url scheme {other:?}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("invalid server url {}", self.url))?;
        url.set_path("/");
        url.set_query(None);
        Ok(url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    pub on_failure: FailurePolicy,
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            retry: self.retry.clone(),
            on_failure: self.on_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Daily-rolling log file, in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ClipConfig {
    /// Load `path`, or `clipflow.toml` when present, then apply the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("CLIPFLOW_URL") {
            self.client.url = url;
        }
        if let Some(session) = var("CLIPFLOW_SESSION") {
            self.client.session = session.parse()?;
        }
        if let Some(port) = var("CLIPFLOW_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("invalid CLIPFLOW_PORT {port:?}"))?;
        }
        if let Some(bind) = var("CLIPFLOW_BIND") {
            self.server.bind = bind;
        }
        if let Some(db) = var("CLIPFLOW_DB") {
            self.server.db = PathBuf::from(db);
        }
        if let Some(level) = var("CLIPFLOW_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }
}
