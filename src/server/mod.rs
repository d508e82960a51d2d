//! Server-side modules for the PlateLog sync server.
//!
//! Authentication is static API keys loaded from a YAML file:
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//! ```

pub mod db;
pub mod meals;
pub mod photos;
pub mod storage;

pub use db::{init_server_db, MealRepository, PhotoRepository};
pub use storage::{PhotoKind, PhotoStore, PhotoStoreError};

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// API key entry in the keys file.
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KeysFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Authenticated user info, added to request extensions after auth.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

/// API key store - maps key -> AuthUser.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Load API keys from the YAML keys file.
    pub fn load(path: &Path) -> Self {
        let keys = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str::<KeysFile>(&contents) {
                Ok(file) => {
                    let mut map = HashMap::new();
                    for entry in file.api_keys {
                        map.insert(
                            entry.key,
                            AuthUser {
                                user_id: entry.user_id,
                            },
                        );
                    }
                    tracing::info!("Loaded {} API key(s)", map.len());
                    map
                }
                Err(e) => {
                    tracing::warn!("Failed to parse keys file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read keys file {}: {}", path.display(), e);
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                HashMap::new()
            }
        };

        Self { keys }
    }

    fn validate(&self, key: &str) -> Option<AuthUser> {
        self.keys.get(key).cloned()
    }

    #[cfg(test)]
    fn with_key(key: &str, user_id: &str) -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            key.to_string(),
            AuthUser {
                user_id: user_id.to_string(),
            },
        );
        Self { keys }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub photos: PhotoStore,
    pub api_keys: Arc<ApiKeyStore>,
    pub signing_secret: Arc<str>,
    /// Size cap for the main photo object, in bytes.
    pub max_photo_bytes: u64,
}

#[derive(Serialize)]
struct AuthError {
    error: &'static str,
    message: &'static str,
}

async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "invalid_auth",
                    message: "Authorization header must use Bearer scheme",
                }),
            )
                .into_response();
        }
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "missing_auth",
                    message: "Authorization header required",
                }),
            )
                .into_response();
        }
    };

    match state.api_keys.validate(api_key) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                error: "invalid_key",
                message: "Invalid API key",
            }),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    // Photo object reads authorize by signature, not bearer token.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/photos/{photo_id}/{kind}", get(photos::fetch_object));

    // The body limit must admit a full photo plus its thumbnail and
    // multipart framing.
    let body_limit = (state.max_photo_bytes as usize) * 2 + 64 * 1024;

    let protected_routes = Router::new()
        .route("/sync/meals", get(meals::list_meals))
        .route("/sync/meals", post(meals::create_meal))
        .route("/sync/meals/{meal_id}", put(meals::update_meal))
        .route("/sync/meals/{meal_id}", delete(meals::delete_meal))
        .route("/sync/photos/upload", post(photos::upload_photo))
        .route("/sync/photos/signed-url", get(photos::signed_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
