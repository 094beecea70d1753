use anyhow::Context;
use clap::Parser;
use cloudmail::api::{ApiServer, AppState};
use cloudmail::cloudflare::{EmailRouter, RouteProvider};
use cloudmail::config::{Config, ConfigHandle, LoggingConfig};
use cloudmail::ingest::{
    AttachmentStore, ImapConnector, InMemoryJobStore, JobStatusStore, MailService,
    MailboxConnector,
};
use cloudmail::store::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cloudmail", version, about = "Disposable email admin console")]
struct Cli {
    /// Configuration file, created with defaults when missing
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, overrides `server.host`/`server.port`
    #[arg(short, long)]
    listen: Option<String>,
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("cloudmail={0},tower_http={0}", config.level))
    });
    let registry = tracing_subscriber::registry().with(filter);

    if config.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_logging(&config.logging);

    info!("Starting cloudmail v{}", env!("CARGO_PKG_VERSION"));
    info!("  Config: {}", cli.config.display());
    info!("  Domains: {}", config.domains().join(", "));

    let addr = cli
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen_addr());

    let db = Database::connect(&config.storage.database_url)
        .await
        .context("failed to open database")?;
    db.init_db().await.context("failed to create tables")?;

    let shutdown = CancellationToken::new();
    let handle = ConfigHandle::new(config.clone(), Some(cli.config.clone()));

    let jobs: Arc<dyn JobStatusStore> = Arc::new(InMemoryJobStore::new(shutdown.clone()));
    let connector: Arc<dyn MailboxConnector> = Arc::new(ImapConnector::new(handle.clone()));
    let attachments = AttachmentStore::new(&config.storage.attachments_dir);
    let mail = MailService::new(db.clone(), handle.clone(), connector, jobs, attachments);
    let routes: Arc<dyn RouteProvider> = Arc::new(EmailRouter::new(handle.clone()));

    let state = Arc::new(AppState::build(db, handle, routes, mail.clone()).await?);

    let scheduler = mail.spawn_scheduler(shutdown.clone());
    let sweeper = state.authenticator.limiter().spawn_sweeper(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
        signal.cancel();
    });

    let server = ApiServer::new(state, addr);
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = tokio::join!(scheduler, sweeper);
    result.context("server error")?;

    info!("cloudmail stopped");
    Ok(())
}
