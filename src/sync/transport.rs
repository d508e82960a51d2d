//! HTTP transport for queued mutations.
//!
//! The processor speaks to the server through the `MutationTransport` trait;
//! tests substitute a scripted fake. `HttpTransport` is the real thing,
//! mapping HTTP status codes onto the outcome taxonomy the state machine in
//! the processor acts on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Meal, MealItem, MealType, MutationRecord, OperationType};

/// Transient delivery failures. Anything in here goes back on the retry
/// schedule; it never reaches the user directly.
#[derive(Debug)]
pub enum TransportError {
    /// Connection failure, DNS failure, or a 5xx from the server.
    Network(String),
    /// The bounded per-attempt wait expired.
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(e) => write!(f, "network error: {}", e),
            TransportError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// What the server said about one mutation attempt.
#[derive(Debug)]
pub enum MutationOutcome {
    /// 2xx. Creates and updates carry the authoritative record back.
    Applied(Option<Meal>),
    /// 404: the meal is already gone server-side. Success-equivalent.
    MissingRemote,
    /// 409: a newer server write exists; its full record rides along so the
    /// client can reconcile without a second round trip.
    Conflict(Box<Meal>),
    /// Non-409 4xx: terminal, user-correctable.
    Invalid(String),
    /// 401/403: terminal, requires re-authentication.
    Unauthorized,
}

#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn send(&self, record: &MutationRecord) -> Result<MutationOutcome, TransportError>;
}

// --- wire bodies ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMealBody<'a> {
    id: Uuid,
    timestamp: DateTime<Utc>,
    meal_type: MealType,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_id: Option<Uuid>,
    items: &'a [MealItem],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMealBody<'a> {
    items: &'a [MealItem],
    updated_at: Option<DateTime<Utc>>,
    timestamp: DateTime<Utc>,
    meal_type: MealType,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMealBody {
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    #[allow(dead_code)]
    error: String,
    server_version: Meal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealPage {
    pub meals: Vec<Meal>,
    pub has_more: bool,
}

/// Real transport over reqwest with a bounded per-attempt timeout.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(
        server_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Quick reachability check against the unauthenticated health endpoint.
    pub async fn check_health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Pulls a page of meals changed since the given token.
    pub async fn fetch_meals(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<MealPage, TransportError> {
        let mut request = self
            .http
            .get(self.url("/sync/meals"))
            .bearer_auth(&self.api_key)
            .query(&[("limit", limit.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let resp = request.send().await.map_err(request_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Network(format!(
                "fetch failed with status {}",
                status
            )));
        }
        resp.json::<MealPage>().await.map_err(request_err)
    }

    async fn interpret(
        &self,
        resp: reqwest::Response,
        expects_meal: bool,
    ) -> Result<MutationOutcome, TransportError> {
        let status = resp.status();

        if status.is_success() {
            if expects_meal {
                let meal = resp.json::<Meal>().await.map_err(request_err)?;
                return Ok(MutationOutcome::Applied(Some(meal)));
            }
            return Ok(MutationOutcome::Applied(None));
        }

        match status.as_u16() {
            404 => Ok(MutationOutcome::MissingRemote),
            409 => match resp.json::<ConflictBody>().await {
                Ok(body) => Ok(MutationOutcome::Conflict(Box::new(body.server_version))),
                // A 409 without a parsable server version cannot be
                // reconciled; treat it as terminal rather than retry forever.
                Err(e) => Ok(MutationOutcome::Invalid(format!(
                    "malformed conflict response: {}",
                    e
                ))),
            },
            401 | 403 => Ok(MutationOutcome::Unauthorized),
            code if (400..500).contains(&code) => {
                let body = resp.text().await.unwrap_or_default();
                Ok(MutationOutcome::Invalid(format!("{}: {}", code, body)))
            }
            _ => Err(TransportError::Network(format!(
                "server error {}",
                status
            ))),
        }
    }
}

fn request_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl MutationTransport for HttpTransport {
    async fn send(&self, record: &MutationRecord) -> Result<MutationOutcome, TransportError> {
        let snapshot = &record.payload;
        let response = match record.operation_type {
            OperationType::Create => {
                let body = CreateMealBody {
                    id: record.target_id,
                    timestamp: snapshot.timestamp,
                    meal_type: snapshot.meal_type,
                    photo_id: snapshot.photo_id,
                    items: &snapshot.items,
                };
                self.http
                    .post(self.url("/sync/meals"))
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
            }
            OperationType::Update => {
                let body = UpdateMealBody {
                    items: &snapshot.items,
                    updated_at: snapshot.base_updated_at,
                    timestamp: snapshot.timestamp,
                    meal_type: snapshot.meal_type,
                    photo_id: snapshot.photo_id,
                };
                self.http
                    .put(self.url(&format!("/sync/meals/{}", record.target_id)))
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
            }
            OperationType::Delete => {
                let body = DeleteMealBody {
                    updated_at: snapshot.base_updated_at,
                };
                self.http
                    .delete(self.url(&format!("/sync/meals/{}", record.target_id)))
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
            }
        };

        let resp = response.map_err(request_err)?;
        let expects_meal = record.operation_type != OperationType::Delete;
        self.interpret(resp, expects_meal).await
    }
}
