//! Photo upload pipeline.
//!
//! Uploads a meal photo and its thumbnail as one multipart request and hands
//! back the stable identifiers the meal mutation will reference. The pipeline
//! has no retry of its own and is never queued durably: binary blobs stay out
//! of the sync queue, only the resulting identifiers are persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use uuid::Uuid;

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMBNAIL_MAX_DIM: u32 = 256;

#[derive(Debug)]
pub enum PhotoUploadError {
    /// The photo exceeds the server's size cap (413). User-correctable,
    /// presented differently from a generic failure.
    QuotaExceeded,
    /// Any other non-2xx response or network failure.
    UploadFailed(String),
    /// The bytes do not decode as an image.
    InvalidImage(String),
}

impl fmt::Display for PhotoUploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhotoUploadError::QuotaExceeded => write!(f, "photo too large for upload quota"),
            PhotoUploadError::UploadFailed(e) => write!(f, "photo upload failed: {}", e),
            PhotoUploadError::InvalidImage(e) => write!(f, "invalid image: {}", e),
        }
    }
}

impl std::error::Error for PhotoUploadError {}

/// Identifiers and metadata returned by the upload endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPhoto {
    pub photo_id: Uuid,
    pub main_photo_key: String,
    pub thumbnail_key: String,
    pub main_photo_size: i64,
    pub thumbnail_size: i64,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait PhotoUploader: Send + Sync {
    async fn upload(
        &self,
        image_bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<UploadedPhoto, PhotoUploadError>;
}

/// Deterministic downscale: same input bytes always produce the same
/// thumbnail bytes. Runs on the CPU only, independent of the network.
pub fn make_thumbnail(bytes: &[u8]) -> Result<Vec<u8>, PhotoUploadError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PhotoUploadError::InvalidImage(e.to_string()))?;

    let thumb = img.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM);
    // JPEG output; flatten any alpha channel first.
    let thumb = DynamicImage::ImageRgb8(thumb.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| PhotoUploadError::InvalidImage(e.to_string()))?;
    Ok(out.into_inner())
}

pub struct HttpPhotoUploader {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPhotoUploader {
    pub fn new(
        server_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, PhotoUploadError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhotoUploadError::UploadFailed(e.to_string()))?;

        Ok(Self {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl PhotoUploader for HttpPhotoUploader {
    async fn upload(
        &self,
        image_bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<UploadedPhoto, PhotoUploadError> {
        // Thumbnailing is CPU work; keep it off the async runtime.
        let source = image_bytes.clone();
        let thumbnail = tokio::task::spawn_blocking(move || make_thumbnail(&source))
            .await
            .map_err(|e| PhotoUploadError::UploadFailed(e.to_string()))??;

        let form = Form::new()
            .part(
                "photo",
                Part::bytes(image_bytes)
                    .file_name("photo")
                    .mime_str(mime_type)
                    .map_err(|e| PhotoUploadError::UploadFailed(e.to_string()))?,
            )
            .part(
                "thumbnail",
                Part::bytes(thumbnail)
                    .file_name("thumbnail.jpg")
                    .mime_str("image/jpeg")
                    .map_err(|e| PhotoUploadError::UploadFailed(e.to_string()))?,
            );

        let resp = self
            .http
            .post(format!("{}/sync/photos/upload", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PhotoUploadError::UploadFailed(e.to_string()))?;

        let status = resp.status();
        match status.as_u16() {
            413 => Err(PhotoUploadError::QuotaExceeded),
            code if (200..300).contains(&code) => resp
                .json::<UploadedPhoto>()
                .await
                .map_err(|e| PhotoUploadError::UploadFailed(e.to_string())),
            code => {
                let body = resp.text().await.unwrap_or_default();
                Err(PhotoUploadError::UploadFailed(format!(
                    "status {}: {}",
                    code, body
                )))
            }
        }
    }
}
