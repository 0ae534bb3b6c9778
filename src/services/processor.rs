//! Executes one queued job end to end: status, fetch, transform, deliver,
//! delete, audit.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::db::JobRepository;
use crate::error::{ErrorClassification, JobError};
use crate::models::audit::{DeletionAuditRecord, DeletionReason, DeletionResult};
use crate::models::job::{JobStatus, JobUpdate, QueuedJob, ToolOptions};
use crate::services::bg_removal::BackgroundRemover;
use crate::services::events::{self, Level};
use crate::services::storage::{ObjectStore, PutObject, StorageError};
use crate::services::transforms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done {
        output_object_key: String,
        output_mime: String,
    },
    /// The record was already terminal; nothing was touched.
    Skipped { status: JobStatus },
}

/// A job that did not complete.
#[derive(Debug, thiserror::Error)]
#[error("job failed with {}: {}", .classification.code, .error)]
pub struct JobFailure {
    pub error: JobError,
    pub classification: ErrorClassification,
    /// Whether the record now holds a terminal status. When it does the
    /// delivery must not be run again.
    pub status_persisted: bool,
}

pub struct JobProcessor {
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobRepository>,
    remover: Arc<dyn BackgroundRemover>,
}

/// Output written and recorded, input not yet deleted.
struct Delivered {
    output_mime: String,
    recorded: bool,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobRepository>,
        remover: Arc<dyn BackgroundRemover>,
    ) -> Self {
        Self {
            store,
            jobs,
            remover,
        }
    }

    pub async fn process_job(&self, job: &QueuedJob) -> Result<JobOutcome, JobFailure> {
        let started = Instant::now();

        // A missing record is processed anyway; its status writes are no-ops.
        let mut status = match self.jobs.get_job(job.id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                events::emit(
                    Level::Info,
                    "worker.job.skipped",
                    json!({ "jobId": job.id, "status": record.status }),
                );
                return Ok(JobOutcome::Skipped {
                    status: record.status,
                });
            }
            Ok(Some(record)) => record.status,
            Ok(None) => JobStatus::Queued,
            Err(e) => return Err(self.fail(job, e.into(), JobStatus::Queued).await),
        };

        let delivered = match self.deliver(job, &mut status).await {
            Ok(delivered) => delivered,
            Err(error) => return Err(self.fail(job, error, status).await),
        };

        if let Err(error) = self.delete_input(job).await {
            // The output is already delivered and recorded as done, which
            // cannot be walked back. Report the failure without rewriting it.
            let error = JobError::from(error);
            let classification = error.classify();
            self.report_failure(job, &classification, delivered.recorded);
            return Err(JobFailure {
                error,
                classification,
                status_persisted: delivered.recorded,
            });
        }

        let elapsed = started.elapsed();
        metrics::histogram!("image_job_processing_seconds", "tool" => job.tool.to_string())
            .record(elapsed.as_secs_f64());
        metrics::counter!("image_jobs_completed_total", "tool" => job.tool.to_string())
            .increment(1);
        events::emit(
            Level::Info,
            "worker.job.done",
            json!({
                "jobId": job.id,
                "tool": job.tool,
                "outputObjectKey": job.output_object_key,
                "outputMime": delivered.output_mime,
                "durationMs": elapsed.as_millis() as u64,
            }),
        );

        Ok(JobOutcome::Done {
            output_object_key: job.output_object_key.clone(),
            output_mime: delivered.output_mime,
        })
    }

    /// Steps up to and including recording `done`.
    async fn deliver(&self, job: &QueuedJob, status: &mut JobStatus) -> Result<Delivered, JobError> {
        self.transition(job, JobUpdate::running(job.id), status).await?;
        events::emit(
            Level::Info,
            "worker.job.running",
            json!({ "jobId": job.id, "tool": job.tool, "subjectId": job.subject_id }),
        );

        let options = job.tool_options()?;

        tracing::debug!(job_id = %job.id, key = %job.input_object_key, "Fetching input object");
        let input = self.store.get_object_buffer(&job.input_object_key).await?;

        let source = match options {
            ToolOptions::BackgroundRemove { .. } => {
                let content_type = input.content_type.as_deref().unwrap_or(&job.input_mime);
                self.remover
                    .remove_background(input.bytes, content_type)
                    .await?
                    .bytes
            }
            _ => input.bytes,
        };

        // Trusted as admitted, even if the plan changed since.
        let watermark = job.watermark_required;
        let transformed = tokio::task::spawn_blocking(move || {
            transforms::run_tool(&options, &source, watermark)
        })
        .await??;

        let output_mime = transformed.mime().to_string();
        self.store
            .put_object_buffer(PutObject {
                key: job.output_object_key.clone(),
                bytes: transformed.bytes,
                content_type: output_mime.clone(),
            })
            .await?;

        let recorded = self
            .transition(
                job,
                JobUpdate::done(job.id, job.output_object_key.clone(), output_mime.clone()),
                status,
            )
            .await?;

        Ok(Delivered {
            output_mime,
            recorded,
        })
    }

    /// Delete the input and record exactly one audit row for the attempt.
    async fn delete_input(&self, job: &QueuedJob) -> Result<(), StorageError> {
        let deleted = self.store.delete_object(&job.input_object_key).await;
        let result = match deleted {
            Ok(()) => DeletionResult::Success,
            Err(_) => DeletionResult::Failure,
        };
        let record = DeletionAuditRecord::new(&job.input_object_key, DeletionReason::Delivered, result);
        if let Err(e) = self.jobs.append_deletion_audit(&record).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to append deletion audit");
        }
        deleted
    }

    /// Persist `update` if the status machine allows it from `current`.
    /// Returns whether the record was changed.
    async fn transition(
        &self,
        job: &QueuedJob,
        update: JobUpdate,
        current: &mut JobStatus,
    ) -> Result<bool, JobError> {
        let next = update.status();
        if !current.can_transition_to(next) {
            return Err(JobError::Validation(format!(
                "job {} cannot move from {} to {}",
                job.id, current, next
            )));
        }
        let applied = self.jobs.update_job_status(&update, Utc::now()).await?;
        *current = next;
        Ok(applied)
    }

    async fn fail(&self, job: &QueuedJob, error: JobError, current: JobStatus) -> JobFailure {
        let classification = error.classify();
        let mut status = current;
        let update = JobUpdate::failed(job.id, classification.code, classification.message.clone());

        let status_persisted = match self.transition(job, update, &mut status).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to persist job failure");
                false
            }
        };

        tracing::warn!(job_id = %job.id, error = %error, "Job processing failed");
        self.report_failure(job, &classification, status_persisted);

        JobFailure {
            error,
            classification,
            status_persisted,
        }
    }

    fn report_failure(&self, job: &QueuedJob, classification: &ErrorClassification, persisted: bool) {
        metrics::counter!("image_jobs_failed_total", "code" => classification.code).increment(1);
        events::emit(
            Level::Error,
            "worker.job.failed",
            json!({
                "jobId": job.id,
                "tool": job.tool,
                "code": classification.code,
                "message": classification.message,
                "statusPersisted": persisted,
            }),
        );
    }
}
