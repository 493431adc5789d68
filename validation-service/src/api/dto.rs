//! HTTP-facing payload shapes. Kept separate from `validation_common`'s
//! domain model so that crate stays free of a `poem_openapi` dependency,
//! mirroring the teacher's own `api::dto` split between wire types and
//! domain types.

use poem_openapi::Object;
use validation_common::invariant::TaskSpec;
use validation_common::model::{
    HealthResponse, InvariantDetail, Job, JobStatus, ResultStatus, SubmitJobRequest,
    SubmitJobResponse, ValidationResult,
};

#[derive(Object, Debug, Clone)]
pub struct SubmitJobRequestDto {
    pub workspace_archive_path: String,
    pub task_id: String,
    /// The task specification document, §4.5. Carried as opaque JSON here
    /// and parsed into the closed invariant set server-side so a malformed
    /// document surfaces as a 422, not a wire-decode failure.
    pub task_spec: serde_json::Value,
    pub timeout_s: Option<u32>,
    pub net_checks: Option<bool>,
    pub stream_log: Option<bool>,
    pub quiet_kernel: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum DtoError {
    #[error("workspace_archive_path is not valid UTF-8 path syntax")]
    InvalidArchivePath,
    #[error("task_spec does not match the invariant schema: {0}")]
    InvalidTaskSpec(serde_json::Error),
}

impl TryFrom<SubmitJobRequestDto> for SubmitJobRequest {
    type Error = DtoError;

    fn try_from(dto: SubmitJobRequestDto) -> Result<Self, Self::Error> {
        let task_spec: TaskSpec =
            serde_json::from_value(dto.task_spec).map_err(DtoError::InvalidTaskSpec)?;
        Ok(SubmitJobRequest {
            workspace_archive_path: dto.workspace_archive_path.into(),
            task_id: dto.task_id,
            task_spec,
            timeout_s: dto.timeout_s.unwrap_or(120),
            net_checks: dto.net_checks.unwrap_or(false),
            stream_log: dto.stream_log.unwrap_or(false),
            quiet_kernel: dto.quiet_kernel.unwrap_or(false),
        })
    }
}

#[derive(Object, Debug, Clone)]
pub struct InvariantDetailDto {
    pub id: String,
    pub passed: bool,
    pub reason: String,
    pub expected: Option<serde_json::Value>,
    pub observed: Option<serde_json::Value>,
}

impl From<&InvariantDetail> for InvariantDetailDto {
    fn from(d: &InvariantDetail) -> Self {
        Self {
            id: d.id.clone(),
            passed: d.passed,
            reason: d.reason.clone(),
            expected: d.expected.clone(),
            observed: d.observed.clone(),
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct ValidationResultDto {
    pub status: String,
    pub score: f64,
    pub passed_invariants: u32,
    pub total_invariants: u32,
    pub detail: Vec<InvariantDetailDto>,
    pub logs_ref: String,
}

impl From<&ValidationResult> for ValidationResultDto {
    fn from(r: &ValidationResult) -> Self {
        Self {
            status: match r.status {
                ResultStatus::Pass => "pass".to_string(),
                ResultStatus::Fail => "fail".to_string(),
            },
            score: r.score,
            passed_invariants: r.passed_invariants,
            total_invariants: r.total_invariants,
            detail: r.detail.iter().map(InvariantDetailDto::from).collect(),
            logs_ref: r.logs_ref.clone(),
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct SubmitJobResponseDto {
    pub job_id: String,
    pub task_id: String,
    pub result: Option<ValidationResultDto>,
    pub log_url: String,
    pub log_path: String,
    pub submission_path: String,
    pub tap_device: Option<String>,
}

impl From<&SubmitJobResponse> for SubmitJobResponseDto {
    fn from(r: &SubmitJobResponse) -> Self {
        Self {
            job_id: r.job_id.to_string(),
            task_id: r.task_id.clone(),
            result: r.result.as_ref().map(ValidationResultDto::from),
            log_url: r.log_url.clone(),
            log_path: r.log_path.display().to_string(),
            submission_path: r.submission_path.display().to_string(),
            tap_device: r.tap_device.clone(),
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct JobDto {
    pub job_id: String,
    pub task_id: String,
    pub status: String,
    pub sequence: u64,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub result: Option<ValidationResultDto>,
    pub tap_device: Option<String>,
    pub timeout_s: u32,
    pub submission_path: String,
    pub log_path: String,
}

impl From<&Job> for JobDto {
    fn from(j: &Job) -> Self {
        Self {
            job_id: j.job_id.to_string(),
            task_id: j.task_id.clone(),
            status: match j.status {
                JobStatus::Queued => "queued",
                JobStatus::Running => "running",
                JobStatus::Done => "done",
                JobStatus::Failed => "failed",
                JobStatus::Cancelled => "cancelled",
            }
            .to_string(),
            sequence: j.sequence,
            enqueued_at: j.enqueued_at.to_rfc3339(),
            started_at: j.started_at.map(|t| t.to_rfc3339()),
            finished_at: j.finished_at.map(|t| t.to_rfc3339()),
            result: j.result.as_ref().map(ValidationResultDto::from),
            tap_device: j.tap_device.clone(),
            timeout_s: j.timeout_s,
            submission_path: j.submission_path.display().to_string(),
            log_path: j.log_path.display().to_string(),
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct JobLogDto {
    pub job_id: String,
    pub status: String,
    pub log_tail: String,
}

#[derive(Object, Debug, Clone)]
pub struct HealthResponseDto {
    pub sandbox_ready: bool,
    pub token_ready: bool,
    pub queue_depth: usize,
    pub workers_total: usize,
    pub workers_idle: usize,
}

impl From<&HealthResponse> for HealthResponseDto {
    fn from(h: &HealthResponse) -> Self {
        Self {
            sandbox_ready: h.sandbox_ready,
            token_ready: h.token_ready,
            queue_depth: h.queue_depth,
            workers_total: h.workers_total,
            workers_idle: h.workers_idle,
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
