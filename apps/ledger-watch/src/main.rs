mod telemetry;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use change_feed::{ChangeFeed, SseChangeFeed};
use clap::{Parser, ValueEnum};
use directories::BaseDirs;
use ledger_store::{EntityKind, RestRowStore, RowStore};
use ledger_sync::{
    gather, FanoutDiagnostics, HostEnvironment, SessionFactory, SessionSpec, SyncConfig,
    SyncMetrics, TracingDiagnostics,
};
use prometheus::Registry;
use telemetry::{LogConfig, LogLevel};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Transactions,
    Incomes,
    Expenses,
}

impl From<Kind> for EntityKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Transactions => EntityKind::Transaction,
            Kind::Incomes => EntityKind::Income,
            Kind::Expenses => EntityKind::Expense,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ledger-watch", about = "Follow one owner's ledger rows live")]
struct Cli {
    /// Owner whose rows are synced.
    #[arg(long, env = "LEDGER_OWNER_ID")]
    owner: String,

    #[arg(long, value_enum, default_value = "transactions")]
    kind: Kind,

    /// Base URL of the row store (`rest/v1/...` is appended).
    #[arg(long, env = "LEDGER_STORE_URL")]
    store_url: String,

    /// Base URL of the change feed; defaults to the store URL.
    #[arg(long, env = "LEDGER_FEED_URL")]
    feed_url: Option<String>,

    #[arg(long, env = "LEDGER_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Client signature checked against known-bad push clients.
    #[arg(long, env = "LEDGER_USER_AGENT")]
    user_agent: Option<String>,

    /// Directory used for the storage probe; defaults to ~/.ledger-watch.
    #[arg(long, env = "LEDGER_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the prometheus text exposition to stdout on exit.
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let token = cli.token.clone().unwrap_or_default();
    let rows: Arc<dyn RowStore> = Arc::new(
        RestRowStore::new(&cli.store_url, token.clone()).context("building row store client")?,
    );
    let feed_url = cli.feed_url.as_deref().unwrap_or(&cli.store_url);
    let feed: Arc<dyn ChangeFeed> =
        Arc::new(SseChangeFeed::new(feed_url, token).context("building change feed client")?);

    let registry = Registry::new();
    let metrics = SyncMetrics::register(&registry).context("registering sync metrics")?;
    let diagnostics = FanoutDiagnostics::default()
        .with(Arc::new(TracingDiagnostics))
        .with(Arc::new(metrics));
    let environment = HostEnvironment {
        storage_dir: cli.state_dir.clone().or_else(default_state_dir),
        user_agent: cli.user_agent.clone(),
    };
    let config = SyncConfig::from_env();

    info!(
        owner = %cli.owner,
        kind = ?cli.kind,
        store = %cli.store_url,
        feed = %feed_url,
        guard_ms = config.guard_timeout.as_millis() as u64,
        poll_ms = config.poll_interval.as_millis() as u64,
        "starting ledger-watch"
    );

    let factory = SessionFactory::new(rows, feed)
        .with_environment(Arc::new(environment))
        .with_config(config)
        .with_diagnostics(Arc::new(diagnostics));
    let session = factory.open(SessionSpec::for_kind(cli.kind.into()), cli.owner.clone());

    let mut state = session.watch_state();
    let mut records = session.watch_records();
    let mut notices = session.notices();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("waiting for ctrl-c")?;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = %current, live_channel = session.has_live_channel(), "connection state");
            }
            changed = records.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = records.borrow_and_update().len();
                info!(count, "records updated");
            }
            notice = notices.recv() => match notice {
                Ok(notice) => warn!(trigger = notice.trigger.as_str(), message = %notice.message, "background fetch failed"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notices dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!(history = ?session.state_history(), "shutting down");
    session.teardown();

    if cli.print_metrics {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&gather(&registry))?;
        stdout.flush()?;
    }
    Ok(())
}

fn default_state_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|base| base.home_dir().join(".ledger-watch"))
}
