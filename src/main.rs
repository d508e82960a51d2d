use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod commands;

use commands::{MealCommand, SyncCommand};
use platelog::config::Config;
use platelog::db::{init_client_db, LocalMealRepository, QueueRepository};
use platelog::sync::{
    BackoffPolicy, HttpPhotoUploader, HttpTransport, MealSyncClient, PhotoUploader,
    SyncQueueProcessor,
};

#[derive(Parser)]
#[command(name = "platelog")]
#[command(version)]
#[command(about = "Offline-first meal logging with background sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log and manage meals
    Meal(MealCommand),

    /// Sync with the server and manage the change queue
    Sync(SyncCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Meal(cmd)) => {
            let pool = init_client_db(Some(config.database_path.clone())).await?;
            let queue = QueueRepository::new(pool.clone());
            let local = LocalMealRepository::new(pool.clone());

            let (photos, processor) = match build_sync(&config, &pool)? {
                Some((uploader, processor)) => (Some(uploader), Some(Arc::new(processor))),
                None => (None, None),
            };

            let client = MealSyncClient::new(queue, local.clone(), photos, processor);
            cmd.run(&client, &local).await?;
        }
        Some(Commands::Sync(cmd)) => {
            let pool = init_client_db(Some(config.database_path.clone())).await?;
            let queue = QueueRepository::new(pool.clone());
            let local = LocalMealRepository::new(pool.clone());

            let timeout = Duration::from_secs(config.sync.request_timeout_secs);
            let transport = match config.sync.credentials() {
                Some((url, key)) => Some(HttpTransport::new(url, key, timeout)?),
                None => None,
            };
            let processor = match build_sync(&config, &pool)? {
                Some((_, processor)) => Some(processor),
                None => None,
            };

            let ctx = commands::SyncContext {
                queue: &queue,
                local: &local,
                transport: transport.as_ref(),
                processor: processor.as_ref(),
            };
            cmd.run(ctx, &config).await?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Builds the uploader and queue processor when a server is configured.
fn build_sync(
    config: &Config,
    pool: &sqlx::SqlitePool,
) -> Result<Option<(Arc<dyn PhotoUploader>, SyncQueueProcessor)>, Box<dyn std::error::Error>> {
    let Some((url, key)) = config.sync.credentials() else {
        return Ok(None);
    };

    let timeout = Duration::from_secs(config.sync.request_timeout_secs);
    let uploader: Arc<dyn PhotoUploader> = Arc::new(HttpPhotoUploader::new(url, key, timeout)?);
    let transport = Arc::new(HttpTransport::new(url, key, timeout)?);
    let processor = SyncQueueProcessor::new(
        QueueRepository::new(pool.clone()),
        LocalMealRepository::new(pool.clone()),
        transport,
        BackoffPolicy::default(),
    );
    Ok(Some((uploader, processor)))
}
