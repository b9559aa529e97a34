use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use koopwatch_core::CityId;
use koopwatch_storage::SqliteStore;
use koopwatch_sync::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "koopwatch-cli")]
#[command(about = "Crawl koopwoning listings per city into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled city once.
    Sync,
    Migrate,
    #[command(subcommand)]
    Cities(CityCommands),
    /// Recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum CityCommands {
    List,
    /// Register a city; new cities start disabled.
    Add { name: String },
    /// Enable exactly these cities and disable all others.
    Enable {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

async fn open_store(config: &SyncConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = koopwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: cities={} closed={} left_open={} not_opened={} pages={} failed_pages={} listings={}",
                summary.enabled_cities,
                summary.runs_closed,
                summary.runs_left_open,
                summary.cities_not_opened,
                summary.totals.pages_fetched,
                summary.totals.pages_failed,
                summary.totals.listings_stored
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Cities(CityCommands::List) => {
            let store = open_store(&config).await?;
            for city in store.list_cities().await? {
                let mark = if city.enabled { "x" } else { " " };
                println!("[{mark}] {:>4}  {}", city.id.0, city.name);
            }
        }
        Commands::Cities(CityCommands::Add { name }) => {
            let store = open_store(&config).await?;
            let id = store
                .add_city(&name)
                .await
                .with_context(|| format!("adding city {name}"))?;
            println!("added {name} as {id} (disabled)");
        }
        Commands::Cities(CityCommands::Enable { ids }) => {
            let store = open_store(&config).await?;
            let ids = ids.into_iter().map(CityId).collect::<Vec<_>>();
            let enabled = store.set_enabled_cities(&ids).await?;
            if enabled < ids.len() as u64 {
                tracing::warn!(requested = ids.len(), enabled, "some city ids do not exist");
            }
            println!("{enabled} cities enabled");
        }
        Commands::Runs { limit } => {
            let store = open_store(&config).await?;
            for overview in store.recent_runs(limit).await? {
                let run = &overview.run;
                let ended = run
                    .end_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5}  {:<6}  {:<20}  pages={:<3}  listings={:<5}  started={}  ended={}",
                    run.id.0,
                    run.state().to_string(),
                    overview.city_name,
                    run.max_page,
                    overview.listing_count,
                    run.start_time.to_rfc3339(),
                    ended
                );
            }
        }
    }

    Ok(())
}
