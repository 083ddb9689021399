use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use listing_common::{Config, ListingError, PropertyId, ScrapeRequest, DEFAULT_LISTING_TYPE};
use listing_refresh::{
    channel::{AmqpChannel, AmqpSettings},
    enrich,
    notify::NotifyRouter,
    reconciler::Reconciler,
    source::HarvestSource,
    store::{OdooStore, RecordStore},
    supervisor::{Supervisor, SupervisorSettings},
    trigger,
};

const API_KEY_HELP: &str = "\
ODOO_API_KEY is not set.

Create an API key in Odoo (Preferences > Account Security > New API Key)
for the user the worker should write as, then set it in the environment
or in a .env file next to the binary:

    ODOO_API_KEY=<your key>
";

#[derive(Parser)]
#[command(
    name = "listing-refresh",
    about = "Keeps tracked real-estate listings fresh from the property-data source"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume scrape requests until interrupted (default)
    Run,
    /// Publish one scrape request, e.g. to re-trigger a failed refresh
    Publish {
        #[arg(long)]
        property_id: i64,
        #[arg(long)]
        address: String,
        #[arg(long, default_value = DEFAULT_LISTING_TYPE)]
        listing_type: String,
    },
    /// Publish a scrape request for every listing still on the market
    RefreshActive {
        #[arg(long, default_value = DEFAULT_LISTING_TYPE)]
        listing_type: String,
    },
}

/// Map `LOG_LEVEL` onto a filter directive. Unknown values mean `info`.
fn log_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_directive(level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info", false);
            if matches!(&e, ListingError::Config(msg) if msg.contains("ODOO_API_KEY")) {
                eprintln!("{API_KEY_HELP}");
            }
            return Err(e).context("loading configuration");
        }
    };
    init_tracing(&config.log_level, config.log_json);
    config.log_keys();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_worker(&config).await,
        Command::Publish {
            property_id,
            address,
            listing_type,
        } => {
            let channel = connect_publisher(&config).await?;
            let request = ScrapeRequest::new(PropertyId(property_id), address)
                .with_listing_type(listing_type);
            let result = trigger::publish_request(&channel, &request).await;
            close(&channel).await;
            result
        }
        Command::RefreshActive { listing_type } => {
            let store = connect_store(&config).await?;
            let channel = connect_publisher(&config).await?;
            let result = trigger::refresh_active(&store, &channel, &listing_type).await;
            close(&channel).await;
            let report = result?;
            if report.failed > 0 {
                anyhow::bail!(
                    "{} of {} refreshes failed to publish",
                    report.failed,
                    report.failed + report.published
                );
            }
            Ok(())
        }
    }
}

async fn run_worker(config: &Config) -> Result<()> {
    info!("Listing refresh worker starting...");

    let store = Arc::new(connect_store(config).await?);
    let source = Arc::new(HarvestSource::from_config(config).context("building source client")?);
    let enricher: Arc<dyn enrich::Enricher> = Arc::from(enrich::from_config(config));
    let reconciler = Arc::new(Reconciler::new(source, enricher, store));

    let settings = AmqpSettings::from_config(config);
    let channel = AmqpChannel::connect(&settings)
        .await
        .context("connecting to message broker")?
        .start_consuming(&settings)
        .await
        .context("starting consumer")?;

    let notifier = Arc::new(NotifyRouter::from_config(config.failure_webhook_url.as_deref()));
    let supervisor = Supervisor::new(
        Arc::new(channel),
        reconciler,
        notifier,
        SupervisorSettings::from_config(config),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let stats = supervisor.run(shutdown).await?;
    info!("Supervisor complete. {stats}");
    Ok(())
}

async fn connect_store(config: &Config) -> Result<OdooStore> {
    let store = OdooStore::from_config(config).context("building record store client")?;
    store.ping().await.context(
        "record store rejected the connection; check ODOO_URL, ODOO_DB_NAME and ODOO_API_KEY",
    )?;
    info!(url = config.odoo_url.as_str(), "Record store reachable");
    Ok(store)
}

async fn connect_publisher(config: &Config) -> Result<AmqpChannel> {
    AmqpChannel::connect(&AmqpSettings::from_config(config))
        .await
        .context("connecting to message broker")
}

async fn close(channel: &AmqpChannel) {
    use listing_refresh::channel::MessageChannel;

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only ctrl-c stops the worker");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received ctrl-c");
    }

    info!("Shutting down");
    shutdown.cancel();
}
