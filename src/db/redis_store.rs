use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{JobRepository, RepositoryError};
use crate::models::audit::DeletionAuditRecord;
use crate::models::job::{ImageJob, JobUpdate};

const JOB_KEY_PREFIX: &str = "image_jobs:job";
const DELETION_AUDIT_KEY: &str = "image_jobs:deletion_audit";

/// Updates only existing, non-terminal jobs. Returns 1 when applied.
const UPDATE_STATUS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local current = redis.call('HGET', KEYS[1], 'status')
if current == 'done' or current == 'failed' then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updatedAt', ARGV[2])
redis.call('HDEL', KEYS[1], 'outputObjectKey', 'outputMime', 'errorCode', 'errorMessage')
if ARGV[3] ~= '' then
  redis.call('HSET', KEYS[1], 'outputObjectKey', ARGV[3], 'outputMime', ARGV[4])
end
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[1], 'errorCode', ARGV[5], 'errorMessage', ARGV[6])
end
return 1
"#;

pub fn job_key(id: Uuid) -> String {
    format!("{}:{}", JOB_KEY_PREFIX, id)
}

/// Low-latency key-value backend: one hash per job, a list for the audit ledger.
pub struct RedisJobRepository {
    conn: MultiplexedConnection,
    update_script: redis::Script,
    closed: AtomicBool,
}

impl RedisJobRepository {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            update_script: redis::Script::new(UPDATE_STATUS_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    fn connection(&self) -> Result<MultiplexedConnection, RepositoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RepositoryError::Closed);
        }
        Ok(self.conn.clone())
    }

    /// Store a queued job, as the admitting API does.
    pub async fn insert_job(&self, job: &ImageJob) -> Result<(), RepositoryError> {
        let mut conn = self.connection()?;
        let fields = job_to_fields(job)?;
        conn.hset_multiple::<_, _, _, ()>(job_key(job.id), fields.as_slice())
            .await?;
        Ok(())
    }

    /// Audit records in append order.
    pub async fn deletion_audit(&self) -> Result<Vec<DeletionAuditRecord>, RepositoryError> {
        let mut conn = self.connection()?;
        let raw: Vec<String> = conn.lrange(DELETION_AUDIT_KEY, 0, -1).await?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(RepositoryError::from))
            .collect()
    }
}

fn job_to_fields(job: &ImageJob) -> Result<Vec<(&'static str, String)>, RepositoryError> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("subjectId", job.subject_id.clone()),
        ("tool", job.tool.to_string()),
        ("plan", job.plan.to_string()),
        ("options", serde_json::to_string(&job.options)?),
        ("inputObjectKey", job.input_object_key.clone()),
        ("inputMime", job.input_mime.clone()),
        ("status", job.status.to_string()),
        ("watermarkRequired", job.watermark_required.to_string()),
        ("createdAt", job.created_at.to_rfc3339()),
        ("updatedAt", job.updated_at.to_rfc3339()),
    ];
    let optional = [
        ("outputObjectKey", &job.output_object_key),
        ("outputMime", &job.output_mime),
        ("errorCode", &job.error_code),
        ("errorMessage", &job.error_message),
    ];
    for (name, value) in optional {
        if let Some(v) = value {
            fields.push((name, v.clone()));
        }
    }
    Ok(fields)
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, RepositoryError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| RepositoryError::Corrupt(format!("missing field {}", name)))
}

fn parsed<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, RepositoryError> {
    let raw = required(fields, name)?;
    raw.parse()
        .map_err(|_| RepositoryError::Corrupt(format!("{} has unknown value {:?}", name, raw)))
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, RepositoryError> {
    let raw = required(fields, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Corrupt(format!("{} is not a timestamp", name)))
}

fn fields_to_job(fields: &HashMap<String, String>) -> Result<ImageJob, RepositoryError> {
    Ok(ImageJob {
        id: parsed(fields, "id")?,
        subject_id: required(fields, "subjectId")?.to_string(),
        tool: parsed(fields, "tool")?,
        plan: parsed(fields, "plan")?,
        options: serde_json::from_str(required(fields, "options")?)?,
        input_object_key: required(fields, "inputObjectKey")?.to_string(),
        output_object_key: fields.get("outputObjectKey").cloned(),
        input_mime: required(fields, "inputMime")?.to_string(),
        output_mime: fields.get("outputMime").cloned(),
        status: parsed(fields, "status")?,
        error_code: fields.get("errorCode").cloned(),
        error_message: fields.get("errorMessage").cloned(),
        watermark_required: parsed(fields, "watermarkRequired")?,
        created_at: timestamp(fields, "createdAt")?,
        updated_at: timestamp(fields, "updatedAt")?,
    })
}

#[async_trait]
impl JobRepository for RedisJobRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, RepositoryError> {
        let mut conn = self.connection()?;
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        fields_to_job(&fields).map(Some)
    }

    async fn update_job_status(
        &self,
        update: &JobUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.connection()?;
        let applied: i64 = self
            .update_script
            .key(job_key(update.id))
            .arg(update.status().to_string())
            .arg(updated_at.to_rfc3339())
            .arg(update.output_object_key().unwrap_or_default())
            .arg(update.output_mime().unwrap_or_default())
            .arg(update.error_code().unwrap_or_default())
            .arg(update.error_message().unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn append_deletion_audit(&self, record: &DeletionAuditRecord) -> Result<(), RepositoryError> {
        let mut conn = self.connection()?;
        let payload = serde_json::to_string(record)?;
        conn.rpush::<_, _, ()>(DELETION_AUDIT_KEY, payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobStatus, Plan, Tool};

    fn sample_job() -> ImageJob {
        let now = Utc::now();
        ImageJob {
            id: Uuid::new_v4(),
            subject_id: "user-1".to_string(),
            tool: Tool::BackgroundRemove,
            plan: Plan::Free,
            options: serde_json::json!({ "outputFormat": "png" }),
            input_object_key: "uploads/a.jpg".to_string(),
            output_object_key: None,
            input_mime: "image/jpeg".to_string(),
            output_mime: None,
            status: JobStatus::Queued,
            error_code: None,
            error_message: None,
            watermark_required: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_hash_fields_roundtrip() {
        let mut job = sample_job();
        job.status = JobStatus::Done;
        job.output_object_key = Some("outputs/a.png".to_string());
        job.output_mime = Some("image/png".to_string());

        let fields: HashMap<String, String> = job_to_fields(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = fields_to_job(&fields).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.status, JobStatus::Done);
        assert_eq!(restored.output_object_key, job.output_object_key);
        assert_eq!(restored.error_code, None);
        assert_eq!(restored.tool, Tool::BackgroundRemove);
        assert_eq!(restored.created_at.timestamp_millis(), job.created_at.timestamp_millis());
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let mut fields: HashMap<String, String> = job_to_fields(&sample_job())
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.remove("status");
        assert!(matches!(fields_to_job(&fields), Err(RepositoryError::Corrupt(_))));
    }
}
