//! HTTP handlers for the meal mutation and pull endpoints.
//!
//! Status mapping: 201 created, 200 applied, 400 invalid request, 404 not
//! found, 409 stale conflict token. A 409 body always carries the full
//! current server record under `serverVersion`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Meal, MealItem, MealType};
use crate::server::db::{
    CreateOutcome, DeleteOutcome, MealPatch, MealRepository, UpdateOutcome,
};
use crate::server::{AppState, AuthUser};

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_version: Option<Meal>,
}

fn validation_error(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: "validation_error",
            message: Some(message.into()),
            server_version: None,
        }),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not_found",
            message: None,
            server_version: None,
        }),
    )
        .into_response()
}

fn conflict(server_version: Meal) -> Response {
    (
        StatusCode::CONFLICT,
        Json(ErrorBody {
            error: "conflict",
            message: None,
            server_version: Some(server_version),
        }),
    )
        .into_response()
}

pub(super) fn internal(e: impl std::fmt::Display) -> Response {
    tracing::error!("request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "internal_error",
            message: None,
            server_version: None,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMealsQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MealPageBody {
    meals: Vec<Meal>,
    has_more: bool,
}

/// GET /sync/meals
pub async fn list_meals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListMealsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let repo = MealRepository::new(state.pool.clone());
    match repo.list_since(&user.user_id, query.since, limit).await {
        Ok((meals, has_more)) => Json(MealPageBody { meals, has_more }).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMealRequest {
    /// Client-generated id. Kept so a replayed create after a lost ack
    /// stays idempotent; the server mints one when absent.
    id: Option<Uuid>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    meal_type: MealType,
    photo_id: Option<Uuid>,
    items: Vec<MealItem>,
}

/// POST /sync/meals
pub async fn create_meal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateMealRequest>,
) -> Response {
    if body.items.is_empty() {
        return validation_error("a meal must have at least one item");
    }

    let meal_id = body.id.unwrap_or_else(Uuid::new_v4);
    let repo = MealRepository::new(state.pool.clone());
    match repo
        .create(
            &user.user_id,
            meal_id,
            body.timestamp,
            body.meal_type,
            body.photo_id,
            &body.items,
        )
        .await
    {
        Ok(CreateOutcome::Created(meal)) => (StatusCode::CREATED, Json(meal)).into_response(),
        // Retried create for an id we already accepted.
        Ok(CreateOutcome::AlreadyExists(meal)) => (StatusCode::OK, Json(meal)).into_response(),
        Ok(CreateOutcome::IdTaken) => validation_error("meal id is not available"),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMealRequest {
    items: Vec<MealItem>,
    updated_at: Option<DateTime<Utc>>,
    timestamp: Option<DateTime<Utc>>,
    meal_type: Option<MealType>,
    photo_id: Option<Uuid>,
}

/// PUT /sync/meals/{meal_id}
pub async fn update_meal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(meal_id): Path<Uuid>,
    Json(body): Json<UpdateMealRequest>,
) -> Response {
    let Some(token) = body.updated_at else {
        return validation_error("updatedAt is required");
    };
    if body.items.is_empty() {
        return validation_error("a meal must have at least one item");
    }

    let patch = MealPatch {
        timestamp: body.timestamp,
        meal_type: body.meal_type,
        photo_id: body.photo_id,
    };

    let repo = MealRepository::new(state.pool.clone());
    match repo
        .update(&user.user_id, meal_id, token, patch, &body.items)
        .await
    {
        Ok(UpdateOutcome::Applied(meal)) => (StatusCode::OK, Json(meal)).into_response(),
        Ok(UpdateOutcome::Conflict(meal)) => conflict(meal),
        Ok(UpdateOutcome::NotFound) => not_found(),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMealRequest {
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMealResponse {
    deleted: bool,
    meal_id: Uuid,
    photo_deleted: bool,
}

/// DELETE /sync/meals/{meal_id}
pub async fn delete_meal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(meal_id): Path<Uuid>,
    Json(body): Json<DeleteMealRequest>,
) -> Response {
    let Some(token) = body.updated_at else {
        return validation_error("updatedAt is required");
    };

    let repo = MealRepository::new(state.pool.clone());
    match repo.delete(&user.user_id, meal_id, token).await {
        Ok(DeleteOutcome::Deleted { photo_id }) => {
            let photo_deleted = match photo_id {
                Some(photo_id) => match state.photos.delete_all(photo_id) {
                    Ok(removed) => removed,
                    // The meal row is already gone; an orphaned object on
                    // disk is acceptable and can be swept later.
                    Err(e) => {
                        tracing::warn!("failed to remove photo objects {}: {}", photo_id, e);
                        false
                    }
                },
                None => false,
            };
            Json(DeleteMealResponse {
                deleted: true,
                meal_id,
                photo_deleted,
            })
            .into_response()
        }
        Ok(DeleteOutcome::Conflict(meal)) => conflict(meal),
        Ok(DeleteOutcome::NotFound) => not_found(),
        Err(e) => internal(e),
    }
}
