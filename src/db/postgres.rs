use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::{JobRepository, RepositoryError};
use crate::models::audit::DeletionAuditRecord;
use crate::models::job::{ImageJob, JobStatus, JobUpdate, Plan, Tool};

/// Durable relational backend.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a queued job, as the admitting API does.
    pub async fn insert_job(&self, job: &ImageJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO image_jobs (id, subject_id, tool, plan, options, input_object_key,
                                    output_object_key, input_mime, output_mime, status,
                                    error_code, error_message, watermark_required,
                                    created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id)
        .bind(&job.subject_id)
        .bind(job.tool.to_string())
        .bind(job.plan.to_string())
        .bind(&job.options)
        .bind(&job.input_object_key)
        .bind(&job.output_object_key)
        .bind(&job.input_mime)
        .bind(&job.output_mime)
        .bind(job.status.to_string())
        .bind(&job.error_code)
        .bind(&job.error_message)
        .bind(job.watermark_required)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, RepositoryError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| RepositoryError::Corrupt(format!("{} has unknown value {:?}", column, raw)))
}

fn row_to_job(row: &PgRow) -> Result<ImageJob, RepositoryError> {
    Ok(ImageJob {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        tool: parse_column::<Tool>(row, "tool")?,
        plan: parse_column::<Plan>(row, "plan")?,
        options: row.try_get("options")?,
        input_object_key: row.try_get("input_object_key")?,
        output_object_key: row.try_get("output_object_key")?,
        input_mime: row.try_get("input_mime")?,
        output_mime: row.try_get("output_mime")?,
        status: parse_column::<JobStatus>(row, "status")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        watermark_required: row.try_get("watermark_required")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, subject_id, tool, plan, options, input_object_key, output_object_key,
                   input_mime, output_mime, status, error_code, error_message,
                   watermark_required, created_at, updated_at
            FROM image_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_job_status(
        &self,
        update: &JobUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // Terminal rows are never rewritten.
        let result = sqlx::query(
            r#"
            UPDATE image_jobs
            SET status = $2,
                output_object_key = $3,
                output_mime = $4,
                error_code = $5,
                error_message = $6,
                updated_at = $7
            WHERE id = $1
              AND status NOT IN ('done', 'failed')
            "#,
        )
        .bind(update.id)
        .bind(update.status().to_string())
        .bind(update.output_object_key())
        .bind(update.output_mime())
        .bind(update.error_code())
        .bind(update.error_message())
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_deletion_audit(&self, record: &DeletionAuditRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO deletion_audit (id, object_key, reason, result, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.object_key)
        .bind(record.reason.to_string())
        .bind(record.result.to_string())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        self.pool.close().await;
        Ok(())
    }
}
