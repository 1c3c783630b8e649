use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Executor, Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ChatRoomId, DriverStats, ProfileSummary, ReviewId, Role, TripId, UserId, VehicleInfo},
    trip::TripDocument,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredReview {
    pub review_id: ReviewId,
    pub trip_id: TripId,
    pub driver_id: UserId,
    pub customer_id: UserId,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReview<'a> {
    pub trip_id: TripId,
    pub driver_id: UserId,
    pub customer_id: UserId,
    pub rating: u8,
    pub comment: Option<&'a str>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        name: &str,
        role: Role,
        vehicle: Option<&VehicleInfo>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (name, role, vehicle_model, vehicle_plate, vehicle_color)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(name)
        .bind(role.as_str())
        .bind(vehicle.map(|v| v.model.as_str()))
        .bind(vehicle.map(|v| v.plate.as_str()))
        .bind(vehicle.and_then(|v| v.color.as_deref()))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn load_profile(&self, user_id: UserId) -> Result<Option<ProfileSummary>> {
        let row = sqlx::query(
            "SELECT name, role, vehicle_model, vehicle_plate, vehicle_color FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let role = Role::from_str(&r.get::<String, _>(1))
            .map_err(|err| anyhow!("user {user_id} has a bad stored role: {err}"))?;
        let vehicle = match (
            r.get::<Option<String>, _>(2),
            r.get::<Option<String>, _>(3),
        ) {
            (Some(model), Some(plate)) => Some(VehicleInfo {
                model,
                plate,
                color: r.get::<Option<String>, _>(4),
            }),
            _ => None,
        };
        Ok(Some(ProfileSummary {
            user_id,
            name: r.get::<String, _>(0),
            role,
            vehicle,
        }))
    }

    pub async fn load_trip(&self, trip_id: TripId) -> Result<Option<TripDocument>> {
        let row = sqlx::query("SELECT document FROM trips WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_document(&r.get::<String, _>(0)))
            .transpose()
    }

    /// Full-record upsert. The stored copy is stamped with `updated_at` and returned.
    pub async fn upsert_trip(&self, document: &TripDocument) -> Result<TripDocument> {
        let stored = stamp(document);
        upsert_document(&self.pool, &stored).await?;
        Ok(stored)
    }

    /// Read-modify-write of one trip inside a single write transaction. `apply` receives the
    /// current document, or `None` for a new trip, and returns the document to store.
    pub async fn update_trip<F>(&self, trip_id: TripId, apply: F) -> Result<TripDocument>
    where
        F: FnOnce(Option<TripDocument>) -> Result<TripDocument>,
    {
        let mut tx = self.pool.begin().await?;
        // Take the write lock before reading so concurrent updates of the trip serialize.
        sqlx::query("UPDATE trips SET revision = revision WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .execute(&mut *tx)
            .await?;
        let current = sqlx::query("SELECT document FROM trips WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| decode_document(&r.get::<String, _>(0)))
            .transpose()?;

        let stored = stamp(&apply(current)?);
        if stored.trip_id != trip_id {
            bail!("update of trip {trip_id} produced trip {}", stored.trip_id);
        }
        upsert_document(&mut *tx, &stored).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Inserts a new trip document. Returns `None` when the trip id is already taken.
    pub async fn insert_trip_if_absent(
        &self,
        document: &TripDocument,
    ) -> Result<Option<TripDocument>> {
        let stored = stamp(document);
        let encoded = serde_json::to_string(&stored)?;
        let inserted = sqlx::query(
            "INSERT INTO trips (trip_id, status, customer_id, driver_id, document)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(trip_id) DO NOTHING",
        )
        .bind(stored.trip_id.to_string())
        .bind(stored.status.as_deref().unwrap_or_default())
        .bind(stored.customer_id.map(|id| id.0))
        .bind(stored.driver_id.map(|id| id.0))
        .bind(encoded)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok((inserted == 1).then_some(stored))
    }

    pub async fn trip_revision(&self, trip_id: TripId) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT revision FROM trips WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)))
    }

    pub async fn list_trips_by_status(
        &self,
        status: &str,
        limit: u32,
    ) -> Result<Vec<TripDocument>> {
        let rows = sqlx::query(
            "SELECT document FROM trips
             WHERE status = ?
             ORDER BY created_at ASC, trip_id ASC
             LIMIT ?",
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_document(&r.get::<String, _>(0)))
            .collect()
    }

    /// Stores a review. Returns `None` when the trip already has one.
    pub async fn insert_review(&self, review: NewReview<'_>) -> Result<Option<StoredReview>> {
        let row = sqlx::query(
            "INSERT INTO reviews (trip_id, driver_id, customer_id, rating, comment)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(trip_id) DO NOTHING
             RETURNING id, created_at",
        )
        .bind(review.trip_id.to_string())
        .bind(review.driver_id.0)
        .bind(review.customer_id.0)
        .bind(i64::from(review.rating))
        .bind(review.comment)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredReview {
            review_id: ReviewId(r.get::<i64, _>(0)),
            trip_id: review.trip_id,
            driver_id: review.driver_id,
            customer_id: review.customer_id,
            rating: review.rating,
            comment: review.comment.map(str::to_string),
            created_at: r.get::<DateTime<Utc>, _>(1),
        }))
    }

    pub async fn driver_stats(&self, driver_id: UserId) -> Result<DriverStats> {
        let row = sqlx::query(
            "SELECT COALESCE(AVG(rating), 0.0), COUNT(*) FROM reviews WHERE driver_id = ?",
        )
        .bind(driver_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(DriverStats {
            average_rating: row.get::<f64, _>(0),
            review_count: u32::try_from(row.get::<i64, _>(1)).unwrap_or(u32::MAX),
        })
    }

    pub async fn chat_room_for_trip(&self, trip_id: TripId) -> Result<Option<ChatRoomId>> {
        let row = sqlx::query("SELECT id FROM chat_rooms WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatRoomId(r.get::<i64, _>(0))))
    }

    /// Idempotent: repeated calls for the same trip return the same room.
    pub async fn ensure_chat_room(&self, trip_id: TripId) -> Result<ChatRoomId> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chat_rooms (trip_id) VALUES (?) ON CONFLICT(trip_id) DO NOTHING")
            .bind(trip_id.to_string())
            .execute(&mut *tx)
            .await?;
        let room_id: i64 = sqlx::query_scalar("SELECT id FROM chat_rooms WHERE trip_id = ?")
            .bind(trip_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ChatRoomId(room_id))
    }
}

async fn upsert_document<'e, E>(executor: E, stored: &TripDocument) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let encoded = serde_json::to_string(stored)?;
    sqlx::query(
        "INSERT INTO trips (trip_id, status, customer_id, driver_id, document)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(trip_id) DO UPDATE SET
            status = excluded.status,
            customer_id = excluded.customer_id,
            driver_id = excluded.driver_id,
            document = excluded.document,
            revision = trips.revision + 1,
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(stored.trip_id.to_string())
    .bind(stored.status.as_deref().unwrap_or_default())
    .bind(stored.customer_id.map(|id| id.0))
    .bind(stored.driver_id.map(|id| id.0))
    .bind(encoded)
    .execute(executor)
    .await?;
    Ok(())
}

fn stamp(document: &TripDocument) -> TripDocument {
    let mut stored = document.clone();
    stored.updated_at = Some(Utc::now());
    stored
}

fn decode_document(raw: &str) -> Result<TripDocument> {
    serde_json::from_str(raw).context("stored trip document is not valid JSON")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
