//! HTTP façade (§4.1, §6). One `#[OpenApi]` impl block exposing the six
//! stable routes, backed by `AppState` (ingestion config, job store,
//! worker pool). `GET /metrics` is not part of this service — it is
//! mounted separately via the Prometheus exporter, same as the
//! teacher's own split between the OpenAPI service and `/metrics`.

pub mod dto;

use std::str::FromStr;
use std::sync::Arc;

use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApi, OpenApiService, Tags};

use validation_common::model::{HealthResponse, Job, JobId};

use crate::ingestion::{self, IngestError};
use crate::job_store::JobStore;
use crate::pool::{PoolError, WorkerPool};
use dto::{
    ErrorBody, HealthResponseDto, JobDto, JobLogDto, SubmitJobRequestDto, SubmitJobResponseDto,
};
use validation_common::config::{IngestionConfig, PathsConfig};

#[derive(Tags)]
enum ApiTags {
    Validation,
    Health,
}

#[derive(ApiResponse, Debug)]
pub enum ApiError {
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 413)]
    TooLarge(Json<ErrorBody>),
    #[oai(status = 422)]
    Unprocessable(Json<ErrorBody>),
    #[oai(status = 429)]
    QueueFull(Json<ErrorBody>, #[oai(header = "Retry-After")] String),
    #[oai(status = 503)]
    NotReady(Json<ErrorBody>),
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(Json(ErrorBody::new(msg)))
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(Json(ErrorBody::new(msg)))
    }
}

impl From<dto::DtoError> for ApiError {
    fn from(value: dto::DtoError) -> Self {
        ApiError::bad_request(value.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::OutsideArchiveRoot => Self::Forbidden(Json(ErrorBody::new(value.to_string()))),
            IngestError::TotalSizeExceeded | IngestError::FileSizeExceeded(_) => {
                Self::TooLarge(Json(ErrorBody::new(value.to_string())))
            }
            IngestError::NotARegularFile | IngestError::WrongExtension => {
                Self::bad_request(value.to_string())
            }
            IngestError::PathTraversal(_)
            | IngestError::SymlinkEntry(_)
            | IngestError::EntryCountExceeded
            | IngestError::PathTooDeep(_) => Self::Unprocessable(Json(ErrorBody::new(value.to_string()))),
            IngestError::Open(_) | IngestError::Io(_) => {
                Self::Internal(Json(ErrorBody::new(value.to_string())))
            }
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::QueueFull => {
                Self::QueueFull(Json(ErrorBody::new(value.to_string())), "1".to_string())
            }
            PoolError::NotReady(_) => Self::NotReady(Json(ErrorBody::new(value.to_string()))),
            PoolError::UnknownJob(_) => Self::not_found(value.to_string()),
            PoolError::AlreadyTerminal(_) => Self::bad_request(value.to_string()),
            PoolError::Store(_) => Self::Internal(Json(ErrorBody::new(value.to_string()))),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Shared handles wired by `bootstrap.rs`, passed by value into every
/// sub-API struct the way the teacher hands `Arc<dyn Trait>` services
/// into its own `XxxApi` structs.
pub struct AppState {
    pub job_store: JobStore,
    pub pool: Arc<WorkerPool>,
    pub ingestion: IngestionConfig,
    pub paths: PathsConfig,
    /// Set once at startup after the sandbox runner's preflight checks
    /// (unprivileged uid, KVM present) pass; independent of
    /// `token_ready`, which tracks the credential manager instead.
    pub sandbox_ready: std::sync::atomic::AtomicBool,
}

pub struct ValidationApi {
    pub state: Arc<AppState>,
}

const MAX_LOG_TAIL_BYTES: usize = 64 * 1024;
const DEFAULT_LOG_TAIL_BYTES: usize = 8 * 1024;
const MAX_TIMEOUT_S: u32 = 600;

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    JobId::from_str(raw).map_err(|_| ApiError::bad_request(format!("{raw:?} is not a valid job id")))
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Validation)]
impl ValidationApi {
    /// Submit a workspace archive for validation. Blocks until the job
    /// terminates (§4.1 "blocking with queueing").
    #[oai(path = "/validate", method = "post", operation_id = "submit_job")]
    async fn submit_job(&self, body: Json<SubmitJobRequestDto>) -> ApiResult<Json<SubmitJobResponseDto>> {
        let request: validation_common::model::SubmitJobRequest = body.0.try_into()?;

        if request.timeout_s == 0 || request.timeout_s > MAX_TIMEOUT_S {
            return Err(ApiError::bad_request(format!(
                "timeout_s must be in 1..={MAX_TIMEOUT_S}"
            )));
        }
        request
            .task_spec
            .validate()
            .map_err(|e| ApiError::Unprocessable(Json(ErrorBody::new(e.to_string()))))?;

        let archive_path =
            ingestion::resolve_archive_path(&request.workspace_archive_path, &self.state.ingestion)?;

        let job_id = JobId::new();
        let submission_path = self
            .state
            .paths
            .submissions_dir(&request.task_id)
            .join(format!("{job_id}.zip"));
        let workspace_path = self.state.paths.workspace_dir(job_id);
        let log_path = self.state.paths.logs_dir(&request.task_id).join(format!("{job_id}.log"));

        if let Some(parent) = submission_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::Internal(Json(ErrorBody::new(e.to_string()))))?;
        }
        std::fs::copy(&archive_path, &submission_path)
            .map_err(|e| ApiError::Internal(Json(ErrorBody::new(e.to_string()))))?;

        ingestion::materialize_and_sanitize(&submission_path, &workspace_path, &self.state.ingestion)?;

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::Internal(Json(ErrorBody::new(e.to_string()))))?;
        }

        let job = self
            .state
            .pool
            .submit(
                job_id,
                request.task_id,
                request.task_spec,
                submission_path,
                workspace_path,
                log_path,
                request.timeout_s,
                request.net_checks,
                request.stream_log,
                request.quiet_kernel,
            )
            .await?;

        Ok(Json(SubmitJobResponseDto::from(&job_to_response(&job))))
    }

    /// Jobs currently `queued` or `running`.
    #[oai(path = "/validate/active", method = "get", operation_id = "list_active_jobs")]
    async fn list_active(&self) -> ApiResult<Json<Vec<JobDto>>> {
        let jobs = self.state.job_store.active();
        Ok(Json(jobs.iter().map(JobDto::from).collect()))
    }

    #[oai(path = "/validate/:job_id", method = "get", operation_id = "get_job")]
    async fn get_job(&self, job_id: Path<String>) -> ApiResult<Json<JobDto>> {
        let job_id = parse_job_id(&job_id.0)?;
        let job = self
            .state
            .job_store
            .get(job_id)
            .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
        Ok(Json(JobDto::from(&job)))
    }

    #[oai(path = "/validate/:job_id/log", method = "get", operation_id = "get_job_log")]
    async fn get_job_log(&self, job_id: Path<String>, tail: Query<Option<u32>>) -> ApiResult<Json<JobLogDto>> {
        let job_id = parse_job_id(&job_id.0)?;
        let job = self
            .state
            .job_store
            .get(job_id)
            .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
        let bound = tail
            .0
            .map(|n| (n as usize).min(MAX_LOG_TAIL_BYTES))
            .unwrap_or(DEFAULT_LOG_TAIL_BYTES);
        Ok(Json(JobLogDto {
            job_id: job.job_id.to_string(),
            status: JobDto::from(&job).status,
            log_tail: job.log_tail_bounded(bound),
        }))
    }

    #[oai(path = "/task/:task_id", method = "get", operation_id = "get_jobs_by_task")]
    async fn get_by_task(&self, task_id: Path<String>) -> ApiResult<Json<Vec<JobDto>>> {
        let jobs = self.state.job_store.by_task(&task_id.0);
        Ok(Json(jobs.iter().map(JobDto::from).collect()))
    }
}

pub struct HealthApi {
    pub state: Arc<AppState>,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Health)]
impl HealthApi {
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Json<HealthResponseDto> {
        let health = HealthResponse {
            sandbox_ready: self.state.sandbox_ready.load(std::sync::atomic::Ordering::SeqCst),
            token_ready: self.state.pool.token_ready(),
            queue_depth: self.state.pool.queue_depth(),
            workers_total: self.state.pool.workers_total(),
            workers_idle: self.state.pool.workers_idle(),
        };
        Json(HealthResponseDto::from(&health))
    }
}

fn job_to_response(job: &Job) -> validation_common::model::SubmitJobResponse {
    validation_common::model::SubmitJobResponse {
        job_id: job.job_id,
        task_id: job.task_id.clone(),
        result: job.result.clone(),
        log_url: format!("/validate/{}/log", job.job_id),
        log_path: job.log_path.clone(),
        submission_path: job.submission_path.clone(),
        tap_device: job.tap_device.clone(),
    }
}

pub type Apis = (ValidationApi, HealthApi);

pub fn make_open_api_service(state: Arc<AppState>) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            ValidationApi { state: state.clone() },
            HealthApi { state },
        ),
        "Sandboxed Validation Engine API",
        env!("CARGO_PKG_VERSION"),
    )
}
