//! `session-tracker` command line.
//!
//! `run` applies newline-delimited JSON accounting events from stdin. The
//! other subcommands query the store and print JSON to stdout. Logs go to
//! stderr, filtered by `RUST_LOG`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use session_tracker::config::TrackerConfig;
use session_tracker::store::StoreClient;
use session_tracker::tracker::{AccountingEvent, Dispatcher, SessionDirectory, SessionTracker};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_WORKERS: usize = 16;

#[derive(Parser)]
#[command(name = "session-tracker")]
#[command(about = "Tracks RADIUS accounting sessions in a shared key-value store")]
#[command(version)]
struct Cli {
    /// Store host (overrides SESSION_STORE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Store port (overrides SESSION_STORE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Logical database index (overrides SESSION_STORE_DB)
    #[arg(long)]
    db: Option<u32>,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Apply accounting events read from stdin, one JSON object per line (default)
    Run {
        /// Events from different NASes are applied on up to this many workers
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
    /// List subjects with at least one live session
    Online,
    /// List live sessions of one subject or one NAS
    Sessions {
        #[arg(long, conflicts_with = "nas", required_unless_present = "nas")]
        user: Option<String>,
        #[arg(long)]
        nas: Option<String>,
    },
    /// Show a single session record
    Show { nas: String, session_id: String },
    /// Drop expired sessions and idle subjects from the online directory
    Reconcile,
}

impl Cli {
    fn config(&self) -> TrackerConfig {
        let mut config = TrackerConfig::from_env();
        if let Some(host) = &self.host {
            config.store.host = host.clone();
        }
        if let Some(port) = self.port {
            config.store.port = port;
        }
        if let Some(db) = self.db {
            config.store.db = db;
        }
        config
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", text);
    Ok(())
}

async fn run(tracker: Arc<SessionTracker>, workers: usize) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut dispatcher = Dispatcher::new(tracker, workers);
    let mut malformed = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read accounting events from stdin")?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<AccountingEvent>(line) {
            Ok(event) => dispatcher.submit(event).await,
            Err(e) => {
                tracing::debug!(line = line_no, error = %e, "skipping malformed accounting event");
                malformed += 1;
            }
        }
    }

    let tally = dispatcher.finish().await;
    tracing::info!(
        applied = tally.applied,
        ignored = tally.ignored,
        unavailable = tally.unavailable,
        malformed,
        "accounting input closed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = cli.config();
    let addr = config.store.addr();
    tracing::debug!(store = %addr, db = config.store.db, ttl = ?config.ttl, "loaded configuration");

    let store = Arc::new(StoreClient::tcp(&config.store));
    let directory = SessionDirectory::new(store.clone());
    let query_context = || format!("Failed to query session store at {}", addr);

    let action = cli.action.unwrap_or(Action::Run {
        workers: DEFAULT_WORKERS,
    });
    match action {
        Action::Run { workers } => {
            run(Arc::new(SessionTracker::new(store, config.ttl)), workers).await
        }
        Action::Online => {
            let subjects = directory
                .online_subjects()
                .await
                .with_context(query_context)?;
            print_json(&subjects)
        }
        Action::Sessions { user, nas } => {
            let sessions = match (user, nas) {
                (Some(user), _) => directory.sessions_for_subject(&user).await,
                (None, Some(nas)) => directory.sessions_for_nas(&nas).await,
                (None, None) => bail!("either --user or --nas is required"),
            }
            .with_context(query_context)?;
            print_json(&sessions)
        }
        Action::Show { nas, session_id } => {
            let Some(record) = directory
                .session(&nas, &session_id)
                .await
                .with_context(query_context)?
            else {
                bail!("no live session {} on NAS {}", session_id, nas);
            };
            print_json(&record)
        }
        Action::Reconcile => {
            let retired = directory
                .reconcile_online_directory()
                .await
                .with_context(query_context)?;
            tracing::info!(retired = retired.len(), "online directory reconciled");
            print_json(&retired)
        }
    }
}
