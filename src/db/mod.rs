mod models;

pub use models::*;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub type DbPool = Arc<PgPool>;

pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(Arc::new(pool))
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn generate_submission_id() -> String {
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d"),
        &Uuid::new_v4().to_string()[..8]
    )
}

pub async fn create_submission(
    pool: &PgPool,
    submission_id: &str,
    file_name: &str,
    visitor_id: &str,
    raw_text: &str,
    tier: Tier,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO submissions (submission_id, file_name, visitor_id, raw_text, paid, tier)
        VALUES ($1, $2, $3, $4, false, $5)
        "#,
    )
    .bind(submission_id)
    .bind(file_name)
    .bind(visitor_id)
    .bind(raw_text)
    .bind(tier)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_visitor_submissions(
    pool: &PgPool,
    visitor_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM submissions WHERE visitor_id = $1")
        .bind(visitor_id)
        .fetch_one(pool)
        .await
}

/// Persistence seam for the delivery workflow. Implemented for `PgPool`;
/// tests substitute an in-memory store.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn fetch(&self, submission_id: &str) -> Result<Option<Submission>, sqlx::Error>;

    /// Idempotent: re-setting `paid` is harmless, and an already-recorded
    /// payment reference is kept.
    async fn mark_paid(
        &self,
        submission_id: &str,
        tier: Tier,
        payment_reference: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    /// Writes the critique only when none is stored yet. Returns whether
    /// this call won the write.
    async fn store_critique_if_absent(
        &self,
        submission_id: &str,
        score: i16,
        critique: &str,
    ) -> Result<bool, sqlx::Error>;

    /// Writes the rewrite only when none is stored yet. Returns whether
    /// this call won the write.
    async fn store_rewrite_if_absent(
        &self,
        submission_id: &str,
        rewrite: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn clear_raw_text(&self, submission_id: &str) -> Result<(), sqlx::Error>;

    /// Sticky: the error is never cleared once set.
    async fn record_processing_error(
        &self,
        submission_id: &str,
        message: &str,
    ) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl SubmissionStore for PgPool {
    async fn fetch(&self, submission_id: &str) -> Result<Option<Submission>, sqlx::Error> {
        sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE submission_id = $1")
            .bind(submission_id)
            .fetch_optional(self)
            .await
    }

    async fn mark_paid(
        &self,
        submission_id: &str,
        tier: Tier,
        payment_reference: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE submissions
            SET paid = true, tier = $2, payment_reference = COALESCE(payment_reference, $3)
            WHERE submission_id = $1
            "#,
        )
        .bind(submission_id)
        .bind(tier)
        .bind(payment_reference)
        .execute(self)
        .await?;
        Ok(())
    }

    async fn store_critique_if_absent(
        &self,
        submission_id: &str,
        score: i16,
        critique: &str,
    ) -> Result<bool, sqlx::Error> {
        // Atomic conditional write: concurrent triggers can at worst duplicate
        // the upstream call, never overwrite a stored artifact.
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET score = $2, critique = $3
            WHERE submission_id = $1 AND critique IS NULL
            "#,
        )
        .bind(submission_id)
        .bind(score)
        .bind(critique)
        .execute(self)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn store_rewrite_if_absent(
        &self,
        submission_id: &str,
        rewrite: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET rewrite = $2
            WHERE submission_id = $1 AND rewrite IS NULL
            "#,
        )
        .bind(submission_id)
        .bind(rewrite)
        .execute(self)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_raw_text(&self, submission_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE submissions SET raw_text = NULL WHERE submission_id = $1")
            .bind(submission_id)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn record_processing_error(
        &self,
        submission_id: &str,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE submissions SET processing_error = $2 WHERE submission_id = $1")
            .bind(submission_id)
            .bind(message)
            .execute(self)
            .await?;
        Ok(())
    }
}
