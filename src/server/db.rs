//! Server-side persistence: meals, their item collections, and photo
//! metadata, plus the optimistic-concurrency conflict check.
//!
//! Every accepted mutation runs in one transaction and replaces the item
//! collection wholesale, so a partial item list is never observable.
//! `meals.updated_at` is the sole conflict token; no meal field changes
//! without it advancing. The write statements are guarded by the token they
//! read, so a writer that lost a race resolves as a conflict instead of
//! silently overwriting the winner.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{Meal, MealItem, MealTotals, MealType};

/// Initialize the server database connection pool and run migrations.
pub async fn init_server_db(db_path: Option<PathBuf>) -> Result<SqlitePool, sqlx::Error> {
    let path = db_path.expect("database path must be provided");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create database directory");
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations/server").run(&pool).await?;

    Ok(pool)
}

/// A write is stale when the server row advanced past what the client saw.
pub(crate) fn is_stale(server_updated_at: DateTime<Utc>, client_token: DateTime<Utc>) -> bool {
    server_updated_at > client_token
}

/// Conflict tokens are stored at microsecond precision and must advance on
/// every accepted write, even within the same instant.
fn next_token(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match previous {
        Some(prev) => now.max(prev + chrono::Duration::milliseconds(1)),
        None => now,
    }
}

fn ts_to_db(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_db(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(e.to_string().into()))
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

#[derive(sqlx::FromRow)]
struct MealRow {
    id: String,
    user_id: String,
    meal_timestamp: String,
    updated_at: String,
    meal_type: String,
    photo_id: Option<String>,
    total_calories: f64,
    total_protein: f64,
    total_carbs: f64,
    total_fat: f64,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    name: String,
    portion: f64,
    portion_unit: String,
    calories: f64,
    protein_g: f64,
    carbs_g: f64,
    fat_g: f64,
    fiber_g: Option<f64>,
    sugar_g: Option<f64>,
    sodium_mg: Option<f64>,
    volume_ml: Option<f64>,
    caffeine_mg: Option<f64>,
}

/// Field changes accepted by an update. `None` leaves the current value.
#[derive(Debug, Default)]
pub struct MealPatch {
    pub timestamp: Option<DateTime<Utc>>,
    pub meal_type: Option<MealType>,
    pub photo_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created(Meal),
    /// The client-generated id already exists for this user: an abandoned
    /// in-flight create being replayed. Idempotent success.
    AlreadyExists(Meal),
    /// The id exists but belongs to someone else.
    IdTaken,
}

#[derive(Debug)]
pub enum UpdateOutcome {
    Applied(Meal),
    /// Rejected as stale; carries the full current server record so the
    /// client can reconcile without another round trip.
    Conflict(Meal),
    NotFound,
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted {
        /// The photo row removed along with the meal, if any. The caller
        /// cleans up the stored objects.
        photo_id: Option<Uuid>,
    },
    Conflict(Meal),
    NotFound,
}

pub struct MealRepository {
    pool: SqlitePool,
}

impl MealRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: &str,
        meal_id: Uuid,
        timestamp: DateTime<Utc>,
        meal_type: MealType,
        photo_id: Option<Uuid>,
        items: &[MealItem],
    ) -> Result<CreateOutcome, sqlx::Error> {
        // Fast path for replayed creates.
        if let Some(outcome) = self.existing_create(user_id, meal_id).await? {
            return Ok(outcome);
        }

        let token = next_token(None, Utc::now());
        let totals = MealTotals::from_items(items);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO meals (id, user_id, meal_timestamp, updated_at, meal_type, photo_id,
                               total_calories, total_protein, total_carbs, total_fat)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(meal_id.to_string())
        .bind(user_id)
        .bind(ts_to_db(timestamp))
        .bind(ts_to_db(token))
        .bind(meal_type.to_string())
        .bind(photo_id.map(|id| id.to_string()))
        .bind(totals.calories)
        .bind(totals.protein)
        .bind(totals.carbs)
        .bind(totals.fat)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // Another create with the same id committed between the fast
            // path and here; the primary key decides the winner.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                return self
                    .existing_create(user_id, meal_id)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound);
            }
            Err(e) => return Err(e),
        }

        insert_items(&mut tx, meal_id, items).await?;
        tx.commit().await?;

        let meal = self
            .get(user_id, meal_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(CreateOutcome::Created(meal))
    }

    /// Resolves a create against an id the server already knows, if any.
    async fn existing_create(
        &self,
        user_id: &str,
        meal_id: Uuid,
    ) -> Result<Option<CreateOutcome>, sqlx::Error> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM meals WHERE id = ?")
                .bind(meal_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((owner,)) if owner == user_id => {
                let meal = self
                    .get(user_id, meal_id)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(Some(CreateOutcome::AlreadyExists(meal)))
            }
            Some(_) => Ok(Some(CreateOutcome::IdTaken)),
            None => Ok(None),
        }
    }

    pub async fn update(
        &self,
        user_id: &str,
        meal_id: Uuid,
        client_token: DateTime<Utc>,
        patch: MealPatch,
        items: &[MealItem],
    ) -> Result<UpdateOutcome, sqlx::Error> {
        let row: Option<MealRow> =
            sqlx::query_as("SELECT * FROM meals WHERE id = ? AND user_id = ?")
                .bind(meal_id.to_string())
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::NotFound);
        };

        let server_token = ts_from_db(&row.updated_at)?;
        if is_stale(server_token, client_token) {
            let current = self
                .get(user_id, meal_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            return Ok(UpdateOutcome::Conflict(current));
        }

        let timestamp = match patch.timestamp {
            Some(t) => t,
            None => ts_from_db(&row.meal_timestamp)?,
        };
        let meal_type = match patch.meal_type {
            Some(t) => t,
            None => row.meal_type.parse().map_err(decode_err)?,
        };
        let photo_id = match patch.photo_id {
            Some(id) => Some(id.to_string()),
            None => row.photo_id.clone(),
        };
        let token = next_token(Some(server_token), Utc::now());
        let totals = MealTotals::from_items(items);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE meals
            SET meal_timestamp = ?, updated_at = ?, meal_type = ?, photo_id = ?,
                total_calories = ?, total_protein = ?, total_carbs = ?, total_fat = ?
            WHERE id = ? AND updated_at = ?
            "#,
        )
        .bind(ts_to_db(timestamp))
        .bind(ts_to_db(token))
        .bind(meal_type.to_string())
        .bind(photo_id)
        .bind(totals.calories)
        .bind(totals.protein)
        .bind(totals.carbs)
        .bind(totals.fat)
        .bind(meal_id.to_string())
        .bind(&row.updated_at)
        .execute(&mut *tx)
        .await?;

        // A concurrent writer committed between the staleness check and this
        // statement; the guard matched nothing, so the late write loses.
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(user_id, meal_id).await? {
                Some(current) => Ok(UpdateOutcome::Conflict(current)),
                None => Ok(UpdateOutcome::NotFound),
            };
        }

        // Items are fully replaced, never diffed.
        sqlx::query("DELETE FROM meal_items WHERE meal_id = ?")
            .bind(meal_id.to_string())
            .execute(&mut *tx)
            .await?;
        insert_items(&mut tx, meal_id, items).await?;
        tx.commit().await?;

        let meal = self
            .get(user_id, meal_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(UpdateOutcome::Applied(meal))
    }

    /// Deleting follows the same staleness check: a meal updated more
    /// recently than the client knew about is not silently lost.
    pub async fn delete(
        &self,
        user_id: &str,
        meal_id: Uuid,
        client_token: DateTime<Utc>,
    ) -> Result<DeleteOutcome, sqlx::Error> {
        let row: Option<MealRow> =
            sqlx::query_as("SELECT * FROM meals WHERE id = ? AND user_id = ?")
                .bind(meal_id.to_string())
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(DeleteOutcome::NotFound);
        };

        let server_token = ts_from_db(&row.updated_at)?;
        if is_stale(server_token, client_token) {
            let current = self
                .get(user_id, meal_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            return Ok(DeleteOutcome::Conflict(current));
        }

        let photo_id = row
            .photo_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| decode_err(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        // Same token guard as update; item rows go with the meal through
        // ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM meals WHERE id = ? AND updated_at = ?")
            .bind(meal_id.to_string())
            .bind(&row.updated_at)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(user_id, meal_id).await? {
                Some(current) => Ok(DeleteOutcome::Conflict(current)),
                None => Ok(DeleteOutcome::NotFound),
            };
        }

        if let Some(photo_id) = photo_id {
            sqlx::query("DELETE FROM photos WHERE id = ?")
                .bind(photo_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(DeleteOutcome::Deleted { photo_id })
    }

    pub async fn get(&self, user_id: &str, meal_id: Uuid) -> Result<Option<Meal>, sqlx::Error> {
        let row: Option<MealRow> =
            sqlx::query_as("SELECT * FROM meals WHERE id = ? AND user_id = ?")
                .bind(meal_id.to_string())
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => self.hydrate(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Meals changed since the given token, newest meal time first.
    /// Returns at most `limit` meals plus a flag for more pages.
    pub async fn list_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<(Vec<Meal>, bool), sqlx::Error> {
        let since = since.map(ts_to_db).unwrap_or_default();
        let rows: Vec<MealRow> = sqlx::query_as(
            r#"
            SELECT * FROM meals
            WHERE user_id = ? AND updated_at > ?
            ORDER BY meal_timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let mut meals = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.into_iter().take(limit as usize) {
            meals.push(self.hydrate(row).await?);
        }
        Ok((meals, has_more))
    }

    async fn hydrate(&self, row: MealRow) -> Result<Meal, sqlx::Error> {
        let items: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT name, portion, portion_unit, calories, protein_g, carbs_g, fat_g,
                   fiber_g, sugar_g, sodium_mg, volume_ml, caffeine_mg
            FROM meal_items
            WHERE meal_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Meal {
            id: Uuid::parse_str(&row.id).map_err(|e| decode_err(e.to_string()))?,
            user_id: row.user_id,
            timestamp: ts_from_db(&row.meal_timestamp)?,
            updated_at: ts_from_db(&row.updated_at)?,
            meal_type: row.meal_type.parse().map_err(decode_err)?,
            photo_id: row
                .photo_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|e| decode_err(e.to_string()))?,
            total_calories: row.total_calories,
            total_protein: row.total_protein,
            total_carbs: row.total_carbs,
            total_fat: row.total_fat,
            items: items
                .into_iter()
                .map(|i| MealItem {
                    name: i.name,
                    portion: i.portion,
                    portion_unit: i.portion_unit,
                    calories: i.calories,
                    protein_g: i.protein_g,
                    carbs_g: i.carbs_g,
                    fat_g: i.fat_g,
                    fiber_g: i.fiber_g,
                    sugar_g: i.sugar_g,
                    sodium_mg: i.sodium_mg,
                    volume_ml: i.volume_ml,
                    caffeine_mg: i.caffeine_mg,
                })
                .collect(),
        })
    }
}

async fn insert_items(
    tx: &mut Transaction<'_, Sqlite>,
    meal_id: Uuid,
    items: &[MealItem],
) -> Result<(), sqlx::Error> {
    for (position, item) in items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO meal_items (meal_id, position, name, portion, portion_unit,
                                    calories, protein_g, carbs_g, fat_g,
                                    fiber_g, sugar_g, sodium_mg, volume_ml, caffeine_mg)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(meal_id.to_string())
        .bind(position as i64)
        .bind(&item.name)
        .bind(item.portion)
        .bind(&item.portion_unit)
        .bind(item.calories)
        .bind(item.protein_g)
        .bind(item.carbs_g)
        .bind(item.fat_g)
        .bind(item.fiber_g)
        .bind(item.sugar_g)
        .bind(item.sodium_mg)
        .bind(item.volume_ml)
        .bind(item.caffeine_mg)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Metadata row for an uploaded photo. Its lifecycle is independent of any
/// meal; an orphaned photo is possible and cleaned up elsewhere.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub id: Uuid,
    pub user_id: String,
    pub main_key: String,
    pub thumbnail_key: String,
    pub main_size: i64,
    pub thumbnail_size: i64,
    pub mime_type: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PhotoRow {
    id: String,
    user_id: String,
    main_key: String,
    thumbnail_key: String,
    main_size: i64,
    thumbnail_size: i64,
    mime_type: String,
    width: Option<i64>,
    height: Option<i64>,
    uploaded_at: String,
}

pub struct PhotoRepository {
    pool: SqlitePool,
}

impl PhotoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, photo: &PhotoRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO photos (id, user_id, main_key, thumbnail_key, main_size,
                                thumbnail_size, mime_type, width, height, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(photo.id.to_string())
        .bind(&photo.user_id)
        .bind(&photo.main_key)
        .bind(&photo.thumbnail_key)
        .bind(photo.main_size)
        .bind(photo.thumbnail_size)
        .bind(&photo.mime_type)
        .bind(photo.width)
        .bind(photo.height)
        .bind(ts_to_db(photo.uploaded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        user_id: &str,
        photo_id: Uuid,
    ) -> Result<Option<PhotoRecord>, sqlx::Error> {
        let row: Option<PhotoRow> =
            sqlx::query_as("SELECT * FROM photos WHERE id = ? AND user_id = ?")
                .bind(photo_id.to_string())
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(hydrate_photo).transpose()
    }

    /// Lookup without ownership check, for signature-authorized object reads.
    pub async fn get_any(&self, photo_id: Uuid) -> Result<Option<PhotoRecord>, sqlx::Error> {
        let row: Option<PhotoRow> = sqlx::query_as("SELECT * FROM photos WHERE id = ?")
            .bind(photo_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(hydrate_photo).transpose()
    }
}

fn hydrate_photo(row: PhotoRow) -> Result<PhotoRecord, sqlx::Error> {
    Ok(PhotoRecord {
        id: Uuid::parse_str(&row.id).map_err(|e| decode_err(e.to_string()))?,
        user_id: row.user_id,
        main_key: row.main_key,
        thumbnail_key: row.thumbnail_key,
        main_size: row.main_size,
        thumbnail_size: row.thumbnail_size,
        mime_type: row.mime_type,
        width: row.width,
        height: row.height,
        uploaded_at: ts_from_db(&row.uploaded_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_repo() -> (tempfile::TempDir, MealRepository) {
        let dir = tempdir().unwrap();
        let pool = init_server_db(Some(dir.path().join("server.db")))
            .await
            .unwrap();
        (dir, MealRepository::new(pool))
    }

    fn items() -> Vec<MealItem> {
        vec![
            MealItem::basic("chicken", 120.0, "g", 198.0, 37.0, 0.0, 4.3),
            MealItem::basic("rice", 200.0, "g", 260.0, 5.0, 56.0, 0.5),
        ]
    }

    async fn create_meal(repo: &MealRepository, user: &str) -> Meal {
        match repo
            .create(
                user,
                Uuid::new_v4(),
                Utc::now(),
                MealType::Dinner,
                None,
                &items(),
            )
            .await
            .unwrap()
        {
            CreateOutcome::Created(meal) => meal,
            other => panic!("expected Created, got {:?}", other),
        }
    }

    #[test]
    fn test_is_stale() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::milliseconds(1);
        assert!(is_stale(t2, t1));
        assert!(!is_stale(t1, t1));
        assert!(!is_stale(t1, t2));
    }

    #[test]
    fn test_next_token_advances_within_same_instant() {
        let now = Utc::now().trunc_subsecs(6);
        let first = next_token(None, now);
        let second = next_token(Some(first), now);
        let third = next_token(Some(second), now);
        assert!(second > first);
        assert!(third > second);
    }

    #[tokio::test]
    async fn test_create_computes_totals_and_token() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;

        assert_eq!(meal.items.len(), 2);
        assert_eq!(meal.total_calories, 458.0);
        assert_eq!(meal.total_protein, 42.0);
        assert_eq!(meal.items[0].name, "chicken");
    }

    #[tokio::test]
    async fn test_create_replay_is_idempotent() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;

        // An abandoned in-flight create retried after restart.
        let outcome = repo
            .create("u1", meal.id, Utc::now(), MealType::Lunch, None, &items())
            .await
            .unwrap();
        match outcome {
            CreateOutcome::AlreadyExists(existing) => assert_eq!(existing, meal),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }

        // Someone else's id is refused.
        let outcome = repo
            .create("u2", meal.id, Utc::now(), MealType::Lunch, None, &items())
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::IdTaken));
    }

    #[tokio::test]
    async fn test_update_with_current_token_advances_it() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;

        let new_items = vec![MealItem::basic("salmon", 150.0, "g", 280.0, 30.0, 0.0, 18.0)];
        let outcome = repo
            .update("u1", meal.id, meal.updated_at, MealPatch::default(), &new_items)
            .await
            .unwrap();

        let updated = match outcome {
            UpdateOutcome::Applied(m) => m,
            other => panic!("expected Applied, got {:?}", other),
        };
        assert!(updated.updated_at > meal.updated_at);
        assert_eq!(updated.items.len(), 1);
        assert_eq!(updated.items[0].name, "salmon");
        assert_eq!(updated.total_calories, 280.0);
    }

    #[tokio::test]
    async fn test_stale_update_rejected_with_unmodified_state() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let t0 = meal.updated_at;

        // Device A wins the race and advances the token to T1.
        let winning = vec![MealItem::basic("pasta", 180.0, "g", 320.0, 11.0, 64.0, 2.0)];
        let applied = match repo
            .update("u1", meal.id, t0, MealPatch::default(), &winning)
            .await
            .unwrap()
        {
            UpdateOutcome::Applied(m) => m,
            other => panic!("expected Applied, got {:?}", other),
        };

        // Device B still claims T0 and must get the T1 record back.
        let losing = vec![MealItem::basic("pizza", 2.0, "slice", 570.0, 24.0, 72.0, 20.0)];
        let outcome = repo
            .update("u1", meal.id, t0, MealPatch::default(), &losing)
            .await
            .unwrap();
        let server_version = match outcome {
            UpdateOutcome::Conflict(m) => m,
            other => panic!("expected Conflict, got {:?}", other),
        };
        assert_eq!(server_version, applied);

        // Server state is untouched by the rejected write.
        let current = repo.get("u1", meal.id).await.unwrap().unwrap();
        assert_eq!(current, applied);
        assert_eq!(current.items[0].name, "pasta");
    }

    #[tokio::test]
    async fn test_update_missing_meal_not_found() {
        let (_dir, repo) = test_repo().await;
        let outcome = repo
            .update("u1", Uuid::new_v4(), Utc::now(), MealPatch::default(), &items())
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_update_is_scoped_to_user() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let outcome = repo
            .update("u2", meal.id, meal.updated_at, MealPatch::default(), &items())
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_update_patch_fields() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let photo_id = Uuid::new_v4();

        let patch = MealPatch {
            timestamp: None,
            meal_type: Some(MealType::Lunch),
            photo_id: Some(photo_id),
        };
        let updated = match repo
            .update("u1", meal.id, meal.updated_at, patch, &items())
            .await
            .unwrap()
        {
            UpdateOutcome::Applied(m) => m,
            other => panic!("expected Applied, got {:?}", other),
        };
        assert_eq!(updated.meal_type, MealType::Lunch);
        assert_eq!(updated.photo_id, Some(photo_id));
        // Unpatched fields survive.
        assert_eq!(updated.timestamp, meal.timestamp);
    }

    #[tokio::test]
    async fn test_stale_delete_rejected() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let t0 = meal.updated_at;

        repo.update("u1", meal.id, t0, MealPatch::default(), &items())
            .await
            .unwrap();

        // Deleting with the old token would silently lose the newer edit.
        let outcome = repo.delete("u1", meal.id, t0).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::Conflict(_)));
        assert!(repo.get("u1", meal.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_meal_items_and_photo_row() {
        let (_dir, repo) = test_repo().await;
        let photos = PhotoRepository::new(repo.pool.clone());
        let photo_id = Uuid::new_v4();
        photos
            .insert(&PhotoRecord {
                id: photo_id,
                user_id: "u1".to_string(),
                main_key: format!("{}/main.jpg", photo_id),
                thumbnail_key: format!("{}/thumb.jpg", photo_id),
                main_size: 2048,
                thumbnail_size: 256,
                mime_type: "image/jpeg".to_string(),
                width: Some(800),
                height: Some(600),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let meal = match repo
            .create(
                "u1",
                Uuid::new_v4(),
                Utc::now(),
                MealType::Dinner,
                Some(photo_id),
                &items(),
            )
            .await
            .unwrap()
        {
            CreateOutcome::Created(m) => m,
            other => panic!("expected Created, got {:?}", other),
        };

        let outcome = repo.delete("u1", meal.id, meal.updated_at).await.unwrap();
        match outcome {
            DeleteOutcome::Deleted { photo_id: deleted } => {
                assert_eq!(deleted, Some(photo_id))
            }
            other => panic!("expected Deleted, got {:?}", other),
        }

        assert!(repo.get("u1", meal.id).await.unwrap().is_none());
        assert!(photos.get("u1", photo_id).await.unwrap().is_none());

        // Deleting again: the meal is gone.
        let outcome = repo.delete("u1", meal.id, meal.updated_at).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_list_since_filters_and_paginates() {
        let (_dir, repo) = test_repo().await;
        let first = create_meal(&repo, "u1").await;
        let second = create_meal(&repo, "u1").await;
        create_meal(&repo, "u2").await;

        let (all, has_more) = repo.list_since("u1", None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!has_more);

        // Page size of one reports another page.
        let (page, has_more) = repo.list_since("u1", None, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(has_more);

        // Only meals changed after `since` come back.
        let newest_token = first.updated_at.max(second.updated_at);
        let (none, has_more) = repo
            .list_since("u1", Some(newest_token), 10)
            .await
            .unwrap();
        assert!(none.is_empty());
        assert!(!has_more);

        let (some, _) = repo
            .list_since("u1", Some(first.updated_at.min(second.updated_at)), 10)
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
    }

    #[tokio::test]
    async fn test_photo_record_roundtrip() {
        let dir = tempdir().unwrap();
        let pool = init_server_db(Some(dir.path().join("photos.db")))
            .await
            .unwrap();
        let photos = PhotoRepository::new(pool);

        let record = PhotoRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            main_key: "k/main.jpg".to_string(),
            thumbnail_key: "k/thumb.jpg".to_string(),
            main_size: 4096,
            thumbnail_size: 512,
            mime_type: "image/png".to_string(),
            width: None,
            height: None,
            uploaded_at: Utc::now().trunc_subsecs(6),
        };
        photos.insert(&record).await.unwrap();

        let loaded = photos.get("u1", record.id).await.unwrap().unwrap();
        assert_eq!(loaded.main_key, record.main_key);
        assert_eq!(loaded.uploaded_at, record.uploaded_at);
        // Ownership is enforced on the authenticated lookup.
        assert!(photos.get("u2", record.id).await.unwrap().is_none());
        assert!(photos.get_any(record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_updates_same_token_one_wins() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let t0 = meal.updated_at;

        let first = vec![MealItem::basic("pasta", 180.0, "g", 320.0, 11.0, 64.0, 2.0)];
        let second = vec![MealItem::basic("pizza", 2.0, "slice", 570.0, 24.0, 72.0, 20.0)];

        // Two devices race the same token; exactly one write may land, the
        // other must see a conflict rather than silently overwrite.
        let (a, b) = tokio::join!(
            repo.update("u1", meal.id, t0, MealPatch::default(), &first),
            repo.update("u1", meal.id, t0, MealPatch::default(), &second),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, UpdateOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1, "exactly one racing update may apply");

        let current = repo.get("u1", meal.id).await.unwrap().unwrap();
        assert!(current.updated_at > t0);
        for outcome in &outcomes {
            match outcome {
                UpdateOutcome::Applied(m) => assert_eq!(m, &current),
                UpdateOutcome::Conflict(server) => assert_eq!(server, &current),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_update_and_delete_same_token() {
        let (_dir, repo) = test_repo().await;
        let meal = create_meal(&repo, "u1").await;
        let t0 = meal.updated_at;

        let edited = vec![MealItem::basic("soup", 300.0, "ml", 150.0, 4.0, 12.0, 8.0)];
        let (update, delete) = tokio::join!(
            repo.update("u1", meal.id, t0, MealPatch::default(), &edited),
            repo.delete("u1", meal.id, t0),
        );
        let update = update.unwrap();
        let delete = delete.unwrap();

        // Whichever lost the race reports a conflict or absence; the two
        // outcomes never both succeed.
        let update_won = matches!(update, UpdateOutcome::Applied(_));
        let delete_won = matches!(delete, DeleteOutcome::Deleted { .. });
        assert!(
            update_won ^ delete_won,
            "update {:?} / delete {:?}",
            update,
            delete
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_same_id_insert_once() {
        let (_dir, repo) = test_repo().await;
        let meal_id = Uuid::new_v4();

        let items_a = items();
        let items_b = items();
        let (a, b) = tokio::join!(
            repo.create("u1", meal_id, Utc::now(), MealType::Dinner, None, &items_a),
            repo.create("u1", meal_id, Utc::now(), MealType::Dinner, None, &items_b),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let created = outcomes
            .iter()
            .filter(|o| matches!(o, CreateOutcome::Created(_)))
            .count();
        let replayed = outcomes
            .iter()
            .filter(|o| matches!(o, CreateOutcome::AlreadyExists(_)))
            .count();
        assert_eq!(created, 1, "the primary key admits exactly one insert");
        assert_eq!(replayed, 1);
    }
}
