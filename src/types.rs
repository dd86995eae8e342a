/// file: src/types.rs
/// description: job model and the typed event envelope decoded from the notification channel
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// The service emits naive UTC timestamps; accept both those and RFC 3339.
pub(crate) mod service_time {
    use super::*;
    use chrono::NaiveDateTime;

    fn parse<E: serde::de::Error>(s: &str) -> Result<DateTime<Utc>, E> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(E::custom)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => parse(&s).map(Some),
                None => Ok(None),
            }
        }
    }
}

/// Opaque identifier of a generation job (a lesson plan on the service side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Progress only carries meaning while the job is running.
    pub fn shows_progress(self) -> bool {
        self == JobStatus::Processing
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(JobStatus::Draft),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SyncError::InvalidMessage(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// A lesson-plan generation job as returned by the service's list/get endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub subject: String,
    #[serde(alias = "gradeLevel")]
    pub grade_level: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: i64,
    #[serde(alias = "createdAt", deserialize_with = "service_time::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(
        default,
        deserialize_with = "service_time::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn snapshot(&self) -> JobSnapshot {
        let mut snapshot = JobSnapshot::seed(self.id.clone(), self.status, self.progress);
        if self.status == JobStatus::Failed {
            snapshot.error = self.error_message.clone();
        }
        snapshot
    }
}

/// The `(status, progress)` pair rendering code consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    /// Builds an externally seeded snapshot, normalising progress for the status.
    pub fn seed(job_id: JobId, status: JobStatus, progress: i64) -> Self {
        let progress = match status {
            JobStatus::Draft | JobStatus::Queued => 0,
            JobStatus::Completed => 100,
            JobStatus::Processing | JobStatus::Failed => clamp_progress(progress),
        };
        Self {
            job_id,
            status,
            progress,
            error: None,
        }
    }
}

pub fn clamp_progress(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}

/// Event names the generation backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProgressUpdate,
    DiscussionUpdate,
    LessonCompleted,
    LessonError,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ProgressUpdate,
        EventKind::DiscussionUpdate,
        EventKind::LessonCompleted,
        EventKind::LessonError,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::ProgressUpdate => "progress_update",
            EventKind::DiscussionUpdate => "discussion_update",
            EventKind::LessonCompleted => "lesson_completed",
            EventKind::LessonError => "lesson_error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A notification decoded at the channel boundary.
///
/// `job_id` is the payload's own `lesson_id` when present, otherwise the job
/// the connection was opened for.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ProgressUpdate { job_id: JobId, progress: i64 },
    DiscussionUpdate { job_id: JobId, content: serde_json::Value },
    LessonCompleted { job_id: JobId, result: serde_json::Value },
    LessonError { job_id: JobId, message: String },
}

// Payload shapes. Unknown fields are ignored, missing required fields fail.
#[derive(Debug, Deserialize)]
struct ProgressPayload {
    #[serde(default, alias = "lessonId", alias = "job_id")]
    lesson_id: Option<String>,
    progress: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default, alias = "lessonId", alias = "job_id")]
    lesson_id: Option<String>,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ScopeOnly {
    #[serde(default, alias = "lessonId", alias = "job_id")]
    lesson_id: Option<String>,
}

impl ChannelEvent {
    /// Decodes a named Socket.IO event into the typed envelope.
    pub fn decode(name: &str, payload: serde_json::Value, connection_job: &JobId) -> SyncResult<Self> {
        let kind = EventKind::from_wire(name).ok_or_else(|| SyncError::UnknownEvent {
            name: name.to_string(),
        })?;
        let scope = |lesson_id: Option<String>| {
            lesson_id.map(JobId::from).unwrap_or_else(|| connection_job.clone())
        };

        let event = match kind {
            EventKind::ProgressUpdate => {
                let body: ProgressPayload = serde_json::from_value(payload)?;
                ChannelEvent::ProgressUpdate {
                    job_id: scope(body.lesson_id),
                    progress: body.progress,
                }
            }
            EventKind::LessonError => {
                let body: ErrorPayload = serde_json::from_value(payload)?;
                ChannelEvent::LessonError {
                    job_id: scope(body.lesson_id),
                    message: body.message,
                }
            }
            EventKind::DiscussionUpdate => ChannelEvent::DiscussionUpdate {
                job_id: scope(embedded_scope(&payload)),
                content: payload,
            },
            EventKind::LessonCompleted => ChannelEvent::LessonCompleted {
                job_id: scope(embedded_scope(&payload)),
                result: payload,
            },
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::ProgressUpdate { .. } => EventKind::ProgressUpdate,
            ChannelEvent::DiscussionUpdate { .. } => EventKind::DiscussionUpdate,
            ChannelEvent::LessonCompleted { .. } => EventKind::LessonCompleted,
            ChannelEvent::LessonError { .. } => EventKind::LessonError,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            ChannelEvent::ProgressUpdate { job_id, .. }
            | ChannelEvent::DiscussionUpdate { job_id, .. }
            | ChannelEvent::LessonCompleted { job_id, .. }
            | ChannelEvent::LessonError { job_id, .. } => job_id,
        }
    }
}

// Opaque payloads may still name their job; anything that isn't an object carries no scope.
fn embedded_scope(payload: &serde_json::Value) -> Option<String> {
    if !payload.is_object() {
        return None;
    }
    serde_json::from_value::<ScopeOnly>(payload.clone())
        .unwrap_or_default()
        .lesson_id
}
