//! Client-held copy of the meal record.
//!
//! Written optimistically when a mutation is enqueued, and replaced wholesale
//! whenever the server returns an authoritative record (a 2xx body or the
//! `serverVersion` carried by a 409). The `updated_at` column is the conflict
//! token this client last saw for the meal; it stays NULL until the server
//! has acknowledged the meal at least once.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Meal;

#[derive(Clone)]
pub struct LocalMealRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct LocalMealRow {
    meal_json: String,
}

impl LocalMealRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes the user's view of a meal at enqueue time. Keeps any existing
    /// conflict token: optimistic writes know nothing the server said.
    pub async fn upsert_optimistic(&self, meal: &Meal) -> Result<(), sqlx::Error> {
        let json = serde_json::to_string(meal).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            r#"
            INSERT INTO local_meals (id, meal_timestamp, updated_at, meal_type, photo_id, meal_json)
            VALUES (?, ?, NULL, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                meal_timestamp = excluded.meal_timestamp,
                meal_type = excluded.meal_type,
                photo_id = excluded.photo_id,
                meal_json = excluded.meal_json
            "#,
        )
        .bind(meal.id.to_string())
        .bind(meal.timestamp.to_rfc3339())
        .bind(meal.meal_type.to_string())
        .bind(meal.photo_id.map(|id| id.to_string()))
        .bind(&json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces the local view with an authoritative server record and
    /// records its `updated_at` as the new conflict token.
    pub async fn adopt_server(&self, meal: &Meal) -> Result<(), sqlx::Error> {
        let json = serde_json::to_string(meal).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            r#"
            INSERT INTO local_meals (id, meal_timestamp, updated_at, meal_type, photo_id, meal_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                meal_timestamp = excluded.meal_timestamp,
                updated_at = excluded.updated_at,
                meal_type = excluded.meal_type,
                photo_id = excluded.photo_id,
                meal_json = excluded.meal_json
            "#,
        )
        .bind(meal.id.to_string())
        .bind(meal.timestamp.to_rfc3339())
        .bind(meal.updated_at.to_rfc3339())
        .bind(meal.meal_type.to_string())
        .bind(meal.photo_id.map(|id| id.to_string()))
        .bind(&json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, meal_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM local_meals WHERE id = ?")
            .bind(meal_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The conflict token this client last saw for a meal, if any.
    pub async fn conflict_token(
        &self,
        meal_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT updated_at FROM local_meals WHERE id = ?")
                .bind(meal_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row.and_then(|(token,)| token) {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| sqlx::Error::Decode(e.to_string().into())),
            None => Ok(None),
        }
    }

    pub async fn get(&self, meal_id: Uuid) -> Result<Option<Meal>, sqlx::Error> {
        let row: Option<LocalMealRow> =
            sqlx::query_as("SELECT meal_json FROM local_meals WHERE id = ?")
                .bind(meal_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| {
            serde_json::from_str(&r.meal_json).map_err(|e| sqlx::Error::Decode(e.to_string().into()))
        })
        .transpose()
    }

    /// All locally known meals, newest meal time first.
    pub async fn list(&self) -> Result<Vec<Meal>, sqlx::Error> {
        let rows: Vec<LocalMealRow> =
            sqlx::query_as("SELECT meal_json FROM local_meals ORDER BY meal_timestamp DESC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|r| {
                serde_json::from_str(&r.meal_json)
                    .map_err(|e| sqlx::Error::Decode(e.to_string().into()))
            })
            .collect()
    }
}
