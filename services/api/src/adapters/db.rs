//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `RelationStore` and `LessonStore` ports from the `core` crate. It handles
//! all interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use driving_school_core::domain::{
    ItemId, Lesson, LessonFieldValue, LessonId, LessonItem, LessonPatch,
};
use driving_school_core::ports::{LessonStore, PortError, PortResult, RelationStore};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the store ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct LessonItemRecord {
    id: i64,
    title: String,
}
impl LessonItemRecord {
    fn to_domain(self) -> LessonItem {
        LessonItem {
            id: ItemId(self.id),
            title: self.title,
        }
    }
}

#[derive(FromRow)]
struct LessonRecord {
    id: i64,
    profile_id: Uuid,
    date: NaiveDate,
    time: NaiveTime,
    duration_hours: f64,
}
impl LessonRecord {
    fn to_domain(self) -> Lesson {
        Lesson {
            id: LessonId(self.id),
            profile_id: self.profile_id,
            date: self.date,
            time: self.time,
            duration_hours: self.duration_hours,
        }
    }
}

/// Maps constraint violations on a write to the matching port error.
fn map_write_error(e: sqlx::Error, subject: String) -> PortError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => PortError::Conflict(subject),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => PortError::NotFound(subject),
        _ => PortError::Unexpected(e.to_string()),
    }
}

//=========================================================================================
// `RelationStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl RelationStore for DbAdapter {
    async fn list_catalog(&self) -> PortResult<Vec<LessonItem>> {
        let records = sqlx::query_as::<_, LessonItemRecord>(
            "SELECT id, title FROM lesson_item ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn list_associations(&self, lesson_id: LessonId) -> PortResult<Vec<LessonItem>> {
        let records = sqlx::query_as::<_, LessonItemRecord>(
            "SELECT li.id, li.title FROM lesson_item_association a \
             JOIN lesson_item li ON li.id = a.lesson_item_id \
             WHERE a.lesson_id = $1 \
             ORDER BY a.created_at ASC, a.lesson_item_id ASC",
        )
        .bind(lesson_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn create_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO lesson_item_association (lesson_id, lesson_item_id) VALUES ($1, $2)",
        )
        .bind(lesson_id.0)
        .bind(item_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, format!("Lesson {} / item {}", lesson_id, item_id)))?;
        Ok(())
    }

    async fn delete_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()> {
        let result = sqlx::query(
            "DELETE FROM lesson_item_association WHERE lesson_id = $1 AND lesson_item_id = $2",
        )
        .bind(lesson_id.0)
        .bind(item_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "Lesson {} is not linked to item {}",
                lesson_id, item_id
            )));
        }
        Ok(())
    }
}

//=========================================================================================
// `LessonStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl LessonStore for DbAdapter {
    async fn get_lesson(&self, lesson_id: LessonId) -> PortResult<Lesson> {
        let record = sqlx::query_as::<_, LessonRecord>(
            "SELECT id, profile_id, date, time, duration_hours FROM lesson WHERE id = $1",
        )
        .bind(lesson_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Lesson {} not found", lesson_id))
            }
            _ => PortError::Unexpected(e.to_string()),
        })?;
        Ok(record.to_domain())
    }

    async fn update_lesson(&self, lesson_id: LessonId, patch: &LessonPatch) -> PortResult<Lesson> {
        patch
            .validate()
            .map_err(|e| PortError::InvalidInput(e.to_string()))?;

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE lesson SET ");
        {
            let mut assignments = builder.separated(", ");
            for change in &patch.changes {
                assignments.push(format!("{} = ", change.field().column()));
                match *change {
                    LessonFieldValue::Date(date) => assignments.push_bind_unseparated(date),
                    LessonFieldValue::Time(time) => assignments.push_bind_unseparated(time),
                    LessonFieldValue::DurationHours(hours) => {
                        assignments.push_bind_unseparated(hours)
                    }
                };
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(lesson_id.0);
        builder.push(" RETURNING id, profile_id, date, time, duration_hours");

        let record = builder
            .build_query_as::<LessonRecord>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .ok_or_else(|| PortError::NotFound(format!("Lesson {} not found", lesson_id)))?;
        Ok(record.to_domain())
    }
}
