use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::JobError;

/// Status of an image job. Transitions only move forward:
/// `queued -> running -> {done, failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// `running -> running` is allowed so a job left running by a crashed
    /// worker can be picked up again on redelivery.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Tool {
    Resize,
    Compress,
    Convert,
    BackgroundRemove,
}

impl Tool {
    /// Advanced tools are watermarked on the free plan.
    pub fn is_advanced(self) -> bool {
        matches!(self, Tool::BackgroundRemove)
    }

    /// Queue tier a job of this tool lands in unless routed explicitly.
    pub fn default_tier(self) -> Tier {
        match self {
            Tool::Resize | Tool::Compress | Tool::Convert => Tier::Fast,
            Tool::BackgroundRemove => Tier::Slow,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
    Team,
}

/// Admission-time watermark policy: free plan + advanced tool.
pub fn watermark_required_for(plan: Plan, tool: Tool) -> bool {
    plan == Plan::Free && tool.is_advanced()
}

/// Independently-bounded queue tiers, grouped by expected processing cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Fast,
    Slow,
    Bulk,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Slow, Tier::Bulk];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFit {
    /// Scale to fit inside the box, preserving aspect ratio.
    #[default]
    Contain,
    /// Fill the box, cropping overflow.
    Cover,
    /// Stretch to the exact box.
    Fill,
}

/// Tool-specific options. Each variant carries only the fields its tool reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "tool",
    content = "options",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ToolOptions {
    Resize {
        width: Option<u32>,
        height: Option<u32>,
        #[serde(default)]
        fit: ResizeFit,
    },
    Compress {
        quality: Option<i32>,
    },
    Convert {
        format: OutputFormat,
        quality: Option<i32>,
    },
    BackgroundRemove {
        #[serde(default)]
        output_format: OutputFormat,
    },
}

/// Job payload as produced by the admitting API and consumed from a tier queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: Uuid,
    pub subject_id: String,
    pub tool: Tool,
    pub plan: Plan,
    pub watermark_required: bool,
    pub input_object_key: String,
    pub output_object_key: String,
    pub input_mime: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl QueuedJob {
    /// Decode `options` against `tool` into the typed union.
    pub fn tool_options(&self) -> Result<ToolOptions, JobError> {
        let options = match &self.options {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        let tagged = serde_json::json!({ "tool": self.tool, "options": options });
        serde_json::from_value(tagged).map_err(|e| {
            JobError::Validation(format!("invalid options for {}: {}", self.tool, e))
        })
    }
}

/// Persisted job record, read by status polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageJob {
    pub id: Uuid,
    pub subject_id: String,
    pub tool: Tool,
    pub plan: Plan,
    pub options: serde_json::Value,
    pub input_object_key: String,
    pub output_object_key: Option<String>,
    pub input_mime: String,
    pub output_mime: Option<String>,
    pub status: JobStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub watermark_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageJob {
    /// Record as the admitter would create it from a payload.
    pub fn queued(job: &QueuedJob, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            subject_id: job.subject_id.clone(),
            tool: job.tool,
            plan: job.plan,
            options: job.options.clone(),
            input_object_key: job.input_object_key.clone(),
            output_object_key: None,
            input_mime: job.input_mime.clone(),
            output_mime: None,
            status: JobStatus::Queued,
            error_code: None,
            error_message: None,
            watermark_required: job.watermark_required,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update in memory, mirroring what the repositories persist.
    pub fn apply(&mut self, update: &JobUpdate, updated_at: DateTime<Utc>) {
        self.status = update.status();
        self.output_object_key = update.output_object_key().map(str::to_string);
        self.output_mime = update.output_mime().map(str::to_string);
        self.error_code = update.error_code().map(str::to_string);
        self.error_message = update.error_message().map(str::to_string);
        self.updated_at = updated_at;
    }
}

/// Partial update of a job's status fields. Only constructible through
/// `running`, `done` and `failed`, so output fields exist iff done and
/// error fields exist iff failed.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub id: Uuid,
    change: StatusChange,
}

#[derive(Debug, Clone, PartialEq)]
enum StatusChange {
    Running,
    Done {
        output_object_key: String,
        output_mime: String,
    },
    Failed {
        error_code: String,
        error_message: String,
    },
}

impl JobUpdate {
    pub fn running(id: Uuid) -> Self {
        Self {
            id,
            change: StatusChange::Running,
        }
    }

    pub fn done(id: Uuid, output_object_key: impl Into<String>, output_mime: impl Into<String>) -> Self {
        Self {
            id,
            change: StatusChange::Done {
                output_object_key: output_object_key.into(),
                output_mime: output_mime.into(),
            },
        }
    }

    pub fn failed(id: Uuid, error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            id,
            change: StatusChange::Failed {
                error_code: error_code.into(),
                error_message: error_message.into(),
            },
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.change {
            StatusChange::Running => JobStatus::Running,
            StatusChange::Done { .. } => JobStatus::Done,
            StatusChange::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn output_object_key(&self) -> Option<&str> {
        match &self.change {
            StatusChange::Done { output_object_key, .. } => Some(output_object_key),
            _ => None,
        }
    }

    pub fn output_mime(&self) -> Option<&str> {
        match &self.change {
            StatusChange::Done { output_mime, .. } => Some(output_mime),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match &self.change {
            StatusChange::Failed { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.change {
            StatusChange::Failed { error_message, .. } => Some(error_message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tool: Tool, options: serde_json::Value) -> QueuedJob {
        QueuedJob {
            id: Uuid::new_v4(),
            subject_id: "user-1".to_string(),
            tool,
            plan: Plan::Free,
            watermark_required: false,
            input_object_key: "in/a.png".to_string(),
            output_object_key: "out/a.png".to_string(),
            input_mime: "image/png".to_string(),
            options,
        }
    }

    #[test]
    fn test_status_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_watermark_policy() {
        assert!(watermark_required_for(Plan::Free, Tool::BackgroundRemove));
        assert!(!watermark_required_for(Plan::Pro, Tool::BackgroundRemove));
        for tool in [Tool::Resize, Tool::Compress, Tool::Convert] {
            assert!(!watermark_required_for(Plan::Free, tool));
        }
    }

    #[test]
    fn test_tool_routing() {
        assert_eq!(Tool::Resize.default_tier(), Tier::Fast);
        assert_eq!(Tool::BackgroundRemove.default_tier(), Tier::Slow);
    }

    #[test]
    fn test_payload_wire_format() {
        let raw = serde_json::json!({
            "id": "6f1c1f0e-8a7e-4b7a-9d0a-1d2c3b4a5e6f",
            "subjectId": "user-9",
            "tool": "background-remove",
            "plan": "free",
            "watermarkRequired": true,
            "inputObjectKey": "uploads/x.jpg",
            "outputObjectKey": "outputs/x.webp",
            "inputMime": "image/jpeg",
            "options": { "outputFormat": "webp" }
        });
        let job: QueuedJob = serde_json::from_value(raw).unwrap();
        assert_eq!(job.tool, Tool::BackgroundRemove);
        assert_eq!(
            job.tool_options().unwrap(),
            ToolOptions::BackgroundRemove {
                output_format: OutputFormat::Webp
            }
        );
    }

    #[test]
    fn test_tool_options_defaults() {
        let job = payload(Tool::Resize, serde_json::json!({ "width": 64 }));
        assert_eq!(
            job.tool_options().unwrap(),
            ToolOptions::Resize {
                width: Some(64),
                height: None,
                fit: ResizeFit::Contain
            }
        );

        let job = payload(Tool::Compress, serde_json::Value::Null);
        assert_eq!(
            job.tool_options().unwrap(),
            ToolOptions::Compress { quality: None }
        );
    }

    #[test]
    fn test_tool_options_rejects_missing_required_field() {
        let job = payload(Tool::Convert, serde_json::json!({ "quality": 50 }));
        assert!(matches!(job.tool_options(), Err(JobError::Validation(_))));
    }

    #[test]
    fn test_update_fields_match_status() {
        let id = Uuid::new_v4();
        let done = JobUpdate::done(id, "out/a.png", "image/png");
        assert_eq!(done.status(), JobStatus::Done);
        assert_eq!(done.output_mime(), Some("image/png"));
        assert_eq!(done.error_code(), None);

        let failed = JobUpdate::failed(id, "STORAGE_ERROR", "boom");
        assert_eq!(failed.output_object_key(), None);
        assert_eq!(failed.error_code(), Some("STORAGE_ERROR"));
    }
}
