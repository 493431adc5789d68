use crate::invariant::TaskSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pass,
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvariantDetail {
    pub id: String,
    pub passed: bool,
    pub reason: String,
    pub expected: Option<serde_json::Value>,
    pub observed: Option<serde_json::Value>,
}

/// The `Result` document, §3. Fail-closed by construction: use
/// [`ValidationResult::fail_closed`] for every code path that can't
/// produce a real evaluation (missing result file, zero invariants,
/// malformed state).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ResultStatus,
    pub score: f64,
    pub passed_invariants: u32,
    pub total_invariants: u32,
    pub detail: Vec<InvariantDetail>,
    pub logs_ref: String,
}

impl ValidationResult {
    pub fn fail_closed(reason: &str, logs_ref: String) -> Self {
        Self {
            status: ResultStatus::Fail,
            score: 0.0,
            passed_invariants: 0,
            total_invariants: 0,
            detail: vec![InvariantDetail {
                id: "_fail_closed".to_string(),
                passed: false,
                reason: reason.to_string(),
                expected: None,
                observed: None,
            }],
            logs_ref,
        }
    }

    pub fn from_detail(detail: Vec<InvariantDetail>, logs_ref: String) -> Self {
        let total = detail.len() as u32;
        let passed = detail.iter().filter(|d| d.passed).count() as u32;
        let (status, score) = if total == 0 {
            (ResultStatus::Fail, 0.0)
        } else if passed == total {
            (ResultStatus::Pass, 1.0)
        } else {
            (ResultStatus::Fail, passed as f64 / total as f64)
        };
        Self {
            status,
            score,
            passed_invariants: passed,
            total_invariants: total,
            detail,
            logs_ref,
        }
    }
}

/// Inputs the caller supplies in `POST /validate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub workspace_archive_path: PathBuf,
    pub task_id: String,
    pub task_spec: TaskSpec,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u32,
    #[serde(default)]
    pub net_checks: bool,
    #[serde(default)]
    pub stream_log: bool,
    #[serde(default)]
    pub quiet_kernel: bool,
}

fn default_timeout_s() -> u32 {
    120
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub task_id: String,
    pub result: Option<ValidationResult>,
    pub log_url: String,
    pub log_path: PathBuf,
    pub submission_path: PathBuf,
    pub tap_device: Option<String>,
}

/// A Job record, owned exclusively by whichever Worker dequeued it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub task_id: String,
    pub status: JobStatus,
    pub sequence: u64,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub task_spec: TaskSpec,
    pub submission_path: PathBuf,
    pub log_path: PathBuf,
    pub result: Option<ValidationResult>,
    pub log_tail: String,
    pub tap_device: Option<String>,
    pub timeout_s: u32,
    pub net_checks: bool,
    pub stream_log: bool,
    pub quiet_kernel: bool,
}

impl Job {
    pub fn log_tail_bounded(&self, max_bytes: usize) -> String {
        let bytes = self.log_tail.as_bytes();
        if bytes.len() <= max_bytes {
            self.log_tail.clone()
        } else {
            String::from_utf8_lossy(&bytes[bytes.len() - max_bytes..]).into_owned()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub sandbox_ready: bool,
    pub token_ready: bool,
    pub queue_depth: usize,
    pub workers_total: usize,
    pub workers_idle: usize,
}
