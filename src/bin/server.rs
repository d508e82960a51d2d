//! PlateLog Sync Server
//!
//! Applies queued meal mutations from clients with optimistic concurrency
//! and stores meal photos behind time-limited signed URLs.
//!
//! # Configuration
//!
//! Environment variables:
//! - `PLATELOG_PORT`: Port to listen on (default: 8080)
//! - `PLATELOG_DATA_DIR`: Directory for the database and photo objects
//!   (default: ~/.local/share/platelog-server)
//! - `PLATELOG_KEYS`: Path to API keys file (default: ~/.config/platelog-server/keys.yaml)
//! - `PLATELOG_SIGNING_SECRET`: Secret for photo URL signatures (default: random per start)
//! - `PLATELOG_MAX_PHOTO_BYTES`: Photo size cap (default: 10485760)
//!
//! # Keys File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//! ```

use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use platelog::server::{init_server_db, router, ApiKeyStore, AppState, PhotoStore};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    port: u16,
    data_dir: PathBuf,
    keys_path: PathBuf,
    signing_secret: Option<String>,
    max_photo_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("PLATELOG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("PLATELOG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("platelog-server")
            });

        let keys_path = std::env::var("PLATELOG_KEYS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("platelog-server")
                    .join("keys.yaml")
            });

        let signing_secret = std::env::var("PLATELOG_SIGNING_SECRET").ok();

        let max_photo_bytes = std::env::var("PLATELOG_MAX_PHOTO_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 1024 * 1024);

        Self {
            port,
            data_dir,
            keys_path,
            signing_secret,
            max_photo_bytes,
        }
    }
}

/// Random hex secret. Signed URLs stop validating across restarts; set
/// `PLATELOG_SIGNING_SECRET` to keep them stable.
fn random_secret() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| format!("{:02x}", rng.random_range(0..=255u8)))
        .collect()
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "platelog_server=info,platelog=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Ensure data directory exists
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Keys file: {}", config.keys_path.display());

    // Initialize database
    let pool = match init_server_db(Some(config.data_dir.join("platelog-server.db"))).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    // Load API keys
    let api_keys = Arc::new(ApiKeyStore::load(&config.keys_path));

    let signing_secret: Arc<str> = match config.signing_secret {
        Some(secret) => secret.into(),
        None => {
            tracing::warn!(
                "PLATELOG_SIGNING_SECRET not set; photo URLs will not survive restarts"
            );
            random_secret().into()
        }
    };

    // Build app state
    let state = AppState {
        pool,
        photos: PhotoStore::new(config.data_dir.join("photos")),
        api_keys,
        signing_secret,
        max_photo_bytes: config.max_photo_bytes,
    };

    let app = router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
