use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coinwatch_adapters::TwitterApi;
use coinwatch_core::SystemClock;
use coinwatch_storage::{HttpFetcher, MemoryStore, Persistence, PgStore};
use coinwatch_sync::{build_routines, routine_by_name, CollectorConfig, Scheduler, ServiceContext, ROUTINES};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "coinwatch")]
#[command(about = "Cryptocurrency metadata collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled routine on its interval until interrupted.
    Run,
    /// Run one routine immediately, ignoring its interval.
    Once { name: String },
    Migrate,
    /// List routines with their effective intervals.
    Routines,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = CollectorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Once { name } => {
            let ctx = service_context(&config, open_store(&config).await?)?;
            let routine = routine_by_name(&ctx, &name)
                .with_context(|| format!("unknown routine `{name}`"))?
                .with_retry(config.retry);
            let report = routine.run(config.retry.attempts).await?;
            println!("{name}: {report:?}");
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Routines => {
            let registry = config.load_routine_registry().await?;
            for (name, hours) in ROUTINES {
                let interval = registry.interval_for(name, chrono::Duration::hours(hours));
                let state = if registry.is_enabled(name) { "enabled" } else { "disabled" };
                println!("{name:<18} every {:>3}h  {state}", interval.num_hours());
            }
        }
    }

    Ok(())
}

async fn open_store(config: &CollectorConfig) -> Result<Arc<dyn Persistence>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn service_context(config: &CollectorConfig, store: Arc<dyn Persistence>) -> Result<ServiceContext> {
    let http = Arc::new(HttpFetcher::new(config.http_client())?);
    let mut ctx = ServiceContext::new(store, Arc::new(SystemClock))
        .configured(config)
        .with_json(http.clone())
        .with_pages(http.clone());

    match &config.twitter_bearer_token {
        Some(token) => ctx = ctx.with_followers(Arc::new(TwitterApi::new(http, token.clone()))),
        None => info!("TWITTER_BEARER_TOKEN not set, twitter followers count as 0"),
    }
    Ok(ctx)
}

async fn run(config: CollectorConfig) -> Result<()> {
    let registry = config.load_routine_registry().await?;
    let ctx = service_context(&config, open_store(&config).await?)?;

    let mut scheduler = Scheduler::new(config.cycle, Arc::new(SystemClock));
    for routine in build_routines(&ctx, &config, &registry) {
        scheduler.add(routine);
    }

    let handle = scheduler.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current cycle");
            handle.cancel();
        }
    });

    scheduler.run().await;
    Ok(())
}
