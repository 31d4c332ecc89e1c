use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::attempt::{
    AttemptStatus, AttemptTrack, ResultPlan, RetakeStatus, TryoutAttempt,
};
use crate::models::tryout::{Question, Subtest, Tryout};
use crate::store::{AttemptStore, ContentStore};

/// Postgres-backed attempt store. Track state lives in JSONB columns; the
/// row is always read and written whole, so every update also refreshes the
/// JSONB blobs.
#[derive(Clone)]
pub struct PgAttemptStore {
    pool: PgPool,
}

impl PgAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_attempt(row: &PgRow) -> Result<TryoutAttempt> {
    let status_raw: String = row.try_get("status")?;
    let status = AttemptStatus::parse(&status_raw).ok_or_else(|| {
        Error::Internal(format!("Unknown attempt status '{status_raw}' in storage"))
    })?;
    let retake_status_raw: String = row.try_get("retake_status")?;
    let retake_status = RetakeStatus::parse(&retake_status_raw).ok_or_else(|| {
        Error::Internal(format!(
            "Unknown retake status '{retake_status_raw}' in storage"
        ))
    })?;
    let result_plan_raw: String = row.try_get("result_plan")?;
    let result_plan = ResultPlan::parse(&result_plan_raw).ok_or_else(|| {
        Error::Internal(format!("Unknown result plan '{result_plan_raw}' in storage"))
    })?;

    let primary: AttemptTrack = serde_json::from_value(row.try_get::<JsonValue, _>("primary_track")?)?;
    let retake: Option<AttemptTrack> = row
        .try_get::<Option<JsonValue>, _>("retake_track")?
        .map(serde_json::from_value)
        .transpose()?;

    Ok(TryoutAttempt {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tryout_id: row.try_get("tryout_id")?,
        status,
        primary,
        retake,
        retake_status,
        retake_count: row.try_get("retake_count")?,
        max_retake: row.try_get("max_retake")?,
        allow_retake: row.try_get("allow_retake")?,
        result_plan,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    async fn find_latest(&self, user_id: Uuid, tryout_id: Uuid) -> Result<Option<TryoutAttempt>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tryout_attempts
            WHERE user_id = $1 AND tryout_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(tryout_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn find_by_id(&self, attempt_id: Uuid) -> Result<Option<TryoutAttempt>> {
        let row = sqlx::query(r#"SELECT * FROM tryout_attempts WHERE id = $1"#)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn insert(&self, attempt: &TryoutAttempt) -> Result<()> {
        let primary = serde_json::to_value(&attempt.primary)?;
        let retake = attempt
            .retake
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO tryout_attempts (
                id, user_id, tryout_id, status, primary_track, retake_track,
                retake_status, retake_count, max_retake, allow_retake,
                result_plan, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(attempt.tryout_id)
        .bind(attempt.status.as_str())
        .bind(primary)
        .bind(retake)
        .bind(attempt.retake_status.as_str())
        .bind(attempt.retake_count)
        .bind(attempt.max_retake)
        .bind(attempt.allow_retake)
        .bind(attempt.result_plan.as_str())
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, attempt: &TryoutAttempt) -> Result<()> {
        let primary = serde_json::to_value(&attempt.primary)?;
        let retake = attempt
            .retake
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE tryout_attempts
            SET status = $2, primary_track = $3, retake_track = $4,
                retake_status = $5, retake_count = $6, max_retake = $7,
                allow_retake = $8, result_plan = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.status.as_str())
        .bind(primary)
        .bind(retake)
        .bind(attempt.retake_status.as_str())
        .bind(attempt.retake_count)
        .bind(attempt.max_retake)
        .bind(attempt.allow_retake)
        .bind(attempt.result_plan.as_str())
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Attempt {} does not exist",
                attempt.id
            )));
        }
        Ok(())
    }
}

/// Postgres-backed tryout content reads. Question banks are JSONB on the
/// subtest row; a malformed bank is surfaced as an error rather than being
/// silently scored as empty.
#[derive(Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_subtest(row: &PgRow) -> Result<Subtest> {
    let questions: Vec<Question> = serde_json::from_value(row.try_get::<JsonValue, _>("questions")?)?;
    Ok(Subtest {
        id: row.try_get("id")?,
        tryout_id: row.try_get("tryout_id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
        duration_minutes: row.try_get("duration_minutes")?,
        questions,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn fetch_tryout(&self, tryout_id: Uuid) -> Result<Option<Tryout>> {
        let tryout = sqlx::query_as::<_, Tryout>(
            r#"
            SELECT id, title, date_open, date_close, created_at, updated_at
            FROM tryouts WHERE id = $1
            "#,
        )
        .bind(tryout_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tryout)
    }

    async fn fetch_subtests(&self, tryout_id: Uuid) -> Result<Vec<Subtest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tryout_id, name, position, duration_minutes, questions, created_at
            FROM subtests
            WHERE tryout_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(tryout_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_subtest).collect()
    }
}
