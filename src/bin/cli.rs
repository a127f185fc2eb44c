use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use clipflow::client::HttpClient;
use clipflow::config::ClipConfig;
use clipflow::session::SessionId;
use clipflow::store::{RemoteStore, SessionStore};
use clipflow::sync::{SessionSynchronizer, SyncStatus, SyncView, WriteOutcome};
use clipflow::{logging, server};

#[derive(Parser)]
#[command(name = "clipflow")]
#[command(
    about = "Shared clipboard: one text document mirrored in real time across every client",
    version
)]
#[command(after_help = "ClipFlow Features:
- Real-time sync of a shared text between any number of clients via WebSocket
- Echo suppression: your own edits never bounce back over what you typed
- SQLite-backed server with per-session write history
- Pipe-friendly get/set for scripting the shared clipboard

Interactive commands inside `clipflow share`:
   :copy   print the current text
   :clear  clear the shared text
   :quit   leave the session")]
struct Cli {
    /// Config file (defaults to ./clipflow.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server websocket url, e.g. ws://localhost:3000/ws
    #[arg(long, global = true)]
    url: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArg {
    /// Session id (defaults to the shared global session)
    #[arg(short, long)]
    session: Option<SessionId>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long)]
        bind: Option<String>,

        /// SQLite database file
        #[arg(long, conflicts_with = "memory")]
        db: Option<PathBuf>,

        /// Keep sessions in memory only
        #[arg(long)]
        memory: bool,
    },

    /// Print the shared text (copy)
    Get {
        #[command(flatten)]
        session: SessionArg,
    },

    /// Replace the shared text; reads stdin when TEXT is omitted (paste)
    Set {
        #[command(flatten)]
        session: SessionArg,

        text: Option<String>,
    },

    /// Clear the shared text
    Clear {
        #[command(flatten)]
        session: SessionArg,
    },

    /// Join a session interactively: each line you type replaces the text
    Share {
        #[command(flatten)]
        session: SessionArg,
    },

    /// Print every update of a session
    Watch {
        #[command(flatten)]
        session: SessionArg,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ClipConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.client.url = url;
    }
    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            db,
            memory,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.server.db = db;
            }
            config.server.memory |= memory;

            println!(
                "{}",
                format!("🌐 Starting server on {}...", config.server.addr())
                    .cyan()
                    .bold()
            );
            server::start(&config.server).await?;
        }

        Commands::Get { session } => {
            let id = session.resolve(&config);
            let client = HttpClient::new(config.client.http_base()?);
            match client.get(&id).await? {
                Some(snapshot) => print!("{}", snapshot.content),
                None => eprintln!("{} session {} does not exist yet", "!".yellow(), id),
            }
        }

        Commands::Set { session, text } => {
            let id = session.resolve(&config);
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            let client = HttpClient::new(config.client.http_base()?);
            let snapshot = client.put(&id, &text).await?;
            eprintln!(
                "{} {} updated (revision {})",
                "✓".green(),
                id.to_string().bright_white(),
                snapshot.revision
            );
        }

        Commands::Clear { session } => {
            let id = session.resolve(&config);
            let client = HttpClient::new(config.client.http_base()?);
            client.put(&id, "").await?;
            eprintln!("{} {} cleared", "✓".green(), id.to_string().bright_white());
        }

        Commands::Share { session } => {
            let id = session.resolve(&config);
            share(&config, id).await?;
        }

        Commands::Watch { session } => {
            let id = session.resolve(&config);
            watch(&config, id).await?;
        }
    }

    Ok(())
}

impl SessionArg {
    fn resolve(self, config: &ClipConfig) -> SessionId {
        self.session.unwrap_or_else(|| config.client.session.clone())
    }
}

async fn connect(config: &ClipConfig) -> Result<Arc<RemoteStore>> {
    let store = RemoteStore::connect(
        &config.client.url,
        config.client.label(),
        config.client.request_timeout(),
    )
    .await?;
    Ok(Arc::new(store))
}

fn status_label(status: SyncStatus) -> ColoredString {
    match status {
        SyncStatus::Connecting => "Connecting...".bright_black(),
        SyncStatus::Connected => "Connected".green(),
        SyncStatus::Syncing => "Syncing...".yellow(),
        SyncStatus::Failed => "Sync failed".red(),
        SyncStatus::Disconnected => "Disconnected".red().bold(),
    }
}

fn render(view: &SyncView) {
    println!("{} {}", "●".bold(), status_label(view.status));
    println!("{}", "─".repeat(60).bright_black());
    println!("{}", view.text);
    println!("{}", "─".repeat(60).bright_black());
}

async fn share(config: &ClipConfig, id: SessionId) -> Result<()> {
    let store = connect(config).await?;
    let sync = SessionSynchronizer::new(store.clone(), id.clone(), config.sync.options());
    sync.mount().await?;

    println!(
        "{} Sharing {} via {}",
        "↔".bright_blue(),
        id.to_string().bright_yellow(),
        config.client.url.bright_blue()
    );

    let mut view_rx = sync.watch();
    let printer = tokio::spawn(async move {
        let mut last: Option<(String, SyncStatus)> = None;
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow_and_update().clone();
            let key = (view.text.clone(), view.status);
            if last.as_ref() != Some(&key) {
                render(&view);
                last = Some(key);
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = match line.as_str() {
            ":quit" => break,
            ":copy" => {
                println!("{}", sync.copy());
                continue;
            }
            ":clear" => sync.clear().await,
            text => sync.edit(text).await,
        };
        if let WriteOutcome::Failed { error } = outcome {
            eprintln!("{} {}", "✗".red(), error);
        }
    }

    sync.unmount().await;
    printer.abort();
    store.close();
    Ok(())
}

async fn watch(config: &ClipConfig, id: SessionId) -> Result<()> {
    let store = connect(config).await?;
    let mut subscription = store.subscribe(&id).await?;

    while let Some(update) = subscription.next().await {
        match update.snapshot {
            Some(snapshot) => {
                println!(
                    "{} {}",
                    format!(
                        "[{} r{}]",
                        snapshot.last_updated.format("%Y-%m-%d %H:%M:%S%.3f"),
                        snapshot.revision
                    )
                    .bright_black(),
                    snapshot.content
                );
            }
            None => println!("{}", "(session does not exist yet)".bright_black()),
        }
    }

    eprintln!("{} connection closed", "!".yellow());
    Ok(())
}
