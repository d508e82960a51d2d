//! HTTP handlers for photo upload and signed-URL access.
//!
//! Uploads are authenticated; object reads are authorized by a time-limited
//! signature instead, so image tags can fetch them without a bearer token.

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::db::{PhotoRecord, PhotoRepository};
use crate::server::meals::internal;
use crate::server::storage::{sign_access, verify_access, PhotoKind};
use crate::server::{AppState, AuthUser};

/// How long a signed photo URL stays valid.
const SIGNED_URL_TTL_SECS: i64 = 600;

#[derive(Serialize)]
struct PhotoError {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn photo_error(status: StatusCode, error: &'static str, message: Option<String>) -> Response {
    (status, Json(PhotoError { error, message })).into_response()
}

/// A body-limit hit inside the multipart stream is a quota problem, not a
/// malformed request; clients treat the two very differently.
fn multipart_error(e: MultipartError) -> Response {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return photo_error(StatusCode::PAYLOAD_TOO_LARGE, "quota_exceeded", None);
    }
    photo_error(
        StatusCode::BAD_REQUEST,
        "validation_error",
        Some(format!("malformed multipart body: {}", e)),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    photo_id: Uuid,
    main_photo_key: String,
    thumbnail_key: String,
    main_photo_size: i64,
    thumbnail_size: i64,
    mime_type: String,
    width: Option<i64>,
    height: Option<i64>,
    uploaded_at: DateTime<Utc>,
}

/// POST /sync/photos/upload
///
/// Expects multipart fields `photo` and `thumbnail`. The size cap applies to
/// the main photo; a hit returns 413 so clients can tell quota from failure.
pub async fn upload_photo(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Response {
    let mut photo: Option<(Vec<u8>, String)> = None;
    let mut thumbnail: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return multipart_error(e),
        };

        let name = field.name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return multipart_error(e),
        };

        match name.as_str() {
            "photo" => photo = Some((bytes, content_type)),
            "thumbnail" => thumbnail = Some(bytes),
            _ => {}
        }
    }

    let Some((photo_bytes, mime_type)) = photo else {
        return photo_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            Some("missing photo field".to_string()),
        );
    };
    let Some(thumbnail_bytes) = thumbnail else {
        return photo_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            Some("missing thumbnail field".to_string()),
        );
    };

    if photo_bytes.len() as u64 > state.max_photo_bytes {
        return photo_error(StatusCode::PAYLOAD_TOO_LARGE, "quota_exceeded", None);
    }

    // Dimensions are informational; a photo that does not decode still
    // stores fine.
    let dims = image::load_from_memory(&photo_bytes)
        .ok()
        .map(|img| (img.width() as i64, img.height() as i64));

    let photo_id = Uuid::new_v4();
    let main_key = match state.photos.store(photo_id, PhotoKind::Main, &photo_bytes) {
        Ok(key) => key,
        Err(e) => return internal(e),
    };
    let thumbnail_key = match state
        .photos
        .store(photo_id, PhotoKind::Thumbnail, &thumbnail_bytes)
    {
        Ok(key) => key,
        Err(e) => return internal(e),
    };

    let record = PhotoRecord {
        id: photo_id,
        user_id: user.user_id.clone(),
        main_key: main_key.clone(),
        thumbnail_key: thumbnail_key.clone(),
        main_size: photo_bytes.len() as i64,
        thumbnail_size: thumbnail_bytes.len() as i64,
        mime_type: mime_type.clone(),
        width: dims.map(|(w, _)| w),
        height: dims.map(|(_, h)| h),
        uploaded_at: Utc::now(),
    };

    let repo = PhotoRepository::new(state.pool.clone());
    if let Err(e) = repo.insert(&record).await {
        // Orphaned objects are swept later; the metadata row is the source
        // of truth for existence.
        let _ = state.photos.delete_all(photo_id);
        return internal(e);
    }

    tracing::info!(
        "stored photo {} for {} ({} bytes)",
        photo_id,
        user.user_id,
        record.main_size
    );

    (
        StatusCode::CREATED,
        Json(UploadResponse {
            photo_id,
            main_photo_key: main_key,
            thumbnail_key,
            main_photo_size: record.main_size,
            thumbnail_size: record.thumbnail_size,
            mime_type,
            width: record.width,
            height: record.height,
            uploaded_at: record.uploaded_at,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlQuery {
    photo_id: Uuid,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    url: String,
    expires: i64,
}

/// GET /sync/photos/signed-url
///
/// Issues a short-lived URL for a photo the caller owns.
pub async fn signed_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<SignedUrlQuery>,
) -> Response {
    let kind = match query.kind.as_deref() {
        None => PhotoKind::Main,
        Some(s) => match PhotoKind::parse(s) {
            Some(kind) => kind,
            None => {
                return photo_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    Some(format!("unknown photo type: {}", s)),
                )
            }
        },
    };

    let repo = PhotoRepository::new(state.pool.clone());
    match repo.get(&user.user_id, query.photo_id).await {
        Ok(Some(_)) => {
            let expires = Utc::now().timestamp() + SIGNED_URL_TTL_SECS;
            let sig = sign_access(&state.signing_secret, query.photo_id, kind, expires);
            Json(SignedUrlResponse {
                url: format!(
                    "/photos/{}/{}?expires={}&sig={}",
                    query.photo_id, kind, expires, sig
                ),
                expires,
            })
            .into_response()
        }
        Ok(None) => photo_error(StatusCode::NOT_FOUND, "not_found", None),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
pub struct FetchObjectQuery {
    expires: i64,
    sig: String,
}

/// GET /photos/{photo_id}/{kind}
///
/// Unauthenticated; the signature is the authorization.
pub async fn fetch_object(
    State(state): State<AppState>,
    Path((photo_id, kind)): Path<(Uuid, String)>,
    Query(query): Query<FetchObjectQuery>,
) -> Response {
    let Some(kind) = PhotoKind::parse(&kind) else {
        return photo_error(StatusCode::NOT_FOUND, "not_found", None);
    };

    if !verify_access(
        &state.signing_secret,
        photo_id,
        kind,
        query.expires,
        &query.sig,
        Utc::now().timestamp(),
    ) {
        return photo_error(StatusCode::FORBIDDEN, "invalid_signature", None);
    }

    let repo = PhotoRepository::new(state.pool.clone());
    let content_type = match repo.get_any(photo_id).await {
        Ok(Some(record)) => match kind {
            PhotoKind::Main => record.mime_type,
            // Thumbnails are always transcoded to JPEG on the client.
            PhotoKind::Thumbnail => "image/jpeg".to_string(),
        },
        Ok(None) => return photo_error(StatusCode::NOT_FOUND, "not_found", None),
        Err(e) => return internal(e),
    };

    match state.photos.load(photo_id, kind) {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Ok(None) => photo_error(StatusCode::NOT_FOUND, "not_found", None),
        Err(e) => internal(e),
    }
}
