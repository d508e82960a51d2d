//! The façade the rest of the application calls to mutate meals.
//!
//! `create`/`update`/`delete` resolve the photo first (nothing is queued
//! until the photo reference exists), persist a mutation record, update the
//! optimistic local view, and kick the processor for just-in-time delivery.
//! The call returns once the record is durable; network failures after that
//! point are the retry schedule's problem, not the caller's.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{LocalMealRepository, QueueRepository};
use crate::models::{Meal, MealSnapshot, MealTotals, MutationRecord, OperationType};

use super::photos::{PhotoUploadError, PhotoUploader};
use super::processor::SyncQueueProcessor;

/// Errors surfaced synchronously by the façade. Everything after the record
/// is durably queued stays silent.
#[derive(Debug)]
pub enum SyncRequestError {
    /// Photo upload failed before anything was queued. `QuotaExceeded`
    /// inside deserves its own user message.
    Photo(PhotoUploadError),
    /// The durable queue could not be written.
    Storage(sqlx::Error),
}

impl fmt::Display for SyncRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRequestError::Photo(e) => write!(f, "{}", e),
            SyncRequestError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for SyncRequestError {}

impl From<PhotoUploadError> for SyncRequestError {
    fn from(e: PhotoUploadError) -> Self {
        SyncRequestError::Photo(e)
    }
}

impl From<sqlx::Error> for SyncRequestError {
    fn from(e: sqlx::Error) -> Self {
        SyncRequestError::Storage(e)
    }
}

/// An unuploaded local photo attached to a create or update.
pub struct NewPhoto {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub struct MealSyncClient {
    queue: QueueRepository,
    local: LocalMealRepository,
    /// `None` when sync is not configured; photos then fail fast.
    photos: Option<Arc<dyn PhotoUploader>>,
    /// `None` when sync is not configured; mutations still queue durably.
    processor: Option<Arc<SyncQueueProcessor>>,
}

impl MealSyncClient {
    pub fn new(
        queue: QueueRepository,
        local: LocalMealRepository,
        photos: Option<Arc<dyn PhotoUploader>>,
        processor: Option<Arc<SyncQueueProcessor>>,
    ) -> Self {
        Self {
            queue,
            local,
            photos,
            processor,
        }
    }

    /// Queues a create for a new meal. Returns the client-generated meal id.
    pub async fn create_meal(
        &self,
        snapshot: MealSnapshot,
        photo: Option<NewPhoto>,
    ) -> Result<Uuid, SyncRequestError> {
        let meal_id = Uuid::new_v4();
        self.sync(meal_id, OperationType::Create, snapshot, photo)
            .await?;
        Ok(meal_id)
    }

    pub async fn update_meal(
        &self,
        meal_id: Uuid,
        snapshot: MealSnapshot,
        photo: Option<NewPhoto>,
    ) -> Result<(), SyncRequestError> {
        self.sync(meal_id, OperationType::Update, snapshot, photo)
            .await
    }

    pub async fn delete_meal(&self, meal_id: Uuid) -> Result<(), SyncRequestError> {
        // The delete payload carries the last-seen state for bookkeeping;
        // only the conflict token matters to the server.
        let snapshot = match self.local.get(meal_id).await? {
            Some(meal) => MealSnapshot {
                timestamp: meal.timestamp,
                meal_type: meal.meal_type,
                photo_id: meal.photo_id,
                items: Vec::new(),
                base_updated_at: None,
            },
            None => MealSnapshot {
                timestamp: chrono::Utc::now(),
                meal_type: Default::default(),
                photo_id: None,
                items: Vec::new(),
                base_updated_at: None,
            },
        };
        self.sync(meal_id, OperationType::Delete, snapshot, None)
            .await
    }

    async fn sync(
        &self,
        target_id: Uuid,
        operation: OperationType,
        mut snapshot: MealSnapshot,
        photo: Option<NewPhoto>,
    ) -> Result<(), SyncRequestError> {
        // Resolve the photo before anything becomes durable: a mutation is
        // never queued with an unresolved photo reference.
        if let Some(photo) = photo {
            if snapshot.photo_id.is_none() {
                let uploader = self.photos.as_ref().ok_or_else(|| {
                    SyncRequestError::Photo(PhotoUploadError::UploadFailed(
                        "sync server not configured".to_string(),
                    ))
                })?;
                let uploaded = uploader.upload(photo.bytes, &photo.mime_type).await?;
                snapshot.photo_id = Some(uploaded.photo_id);
            }
        }

        if operation != OperationType::Create && snapshot.base_updated_at.is_none() {
            snapshot.base_updated_at = self.local.conflict_token(target_id).await?;
        }

        let record = MutationRecord::new(operation, target_id, snapshot.clone());
        self.queue.enqueue(&record).await?;

        // Optimistic local view so the user sees their own edit immediately.
        match operation {
            OperationType::Delete => self.local.remove(target_id).await?,
            _ => {
                let totals = MealTotals::from_items(&snapshot.items);
                let meal = Meal {
                    id: target_id,
                    user_id: String::new(),
                    timestamp: snapshot.timestamp,
                    updated_at: record.created_at,
                    meal_type: snapshot.meal_type,
                    photo_id: snapshot.photo_id,
                    total_calories: totals.calories,
                    total_protein: totals.protein,
                    total_carbs: totals.carbs,
                    total_fat: totals.fat,
                    items: snapshot.items,
                };
                self.local.upsert_optimistic(&meal).await?;
            }
        }

        // Just-in-time delivery. The queue is the durability mechanism, not
        // an artificial delay; a failure here is absorbed by the schedule.
        if let Some(processor) = &self.processor {
            let processor = processor.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.drain().await {
                    tracing::warn!(error = %e, "just-in-time drain failed");
                }
            });
        }

        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64, sqlx::Error> {
        self.queue.pending_count().await
    }

    pub async fn needs_attention(&self) -> Result<Vec<MutationRecord>, sqlx::Error> {
        self.queue.needs_attention().await
    }
}
