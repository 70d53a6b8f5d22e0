//! HTTP routes mapping queue operations to JSON requests.

use std::sync::Arc;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use netsched_core::{
    DispatchedJob, JobDescription, JobId, JobStatus, JobSubmission, NsError, Outcome, Queue,
    QueueConfig, QueueRegistry, WorkerNode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Application state shared across handlers.
pub struct AppState {
    pub registry: Arc<QueueRegistry>,
    /// Signalled when a request hits an unrecoverable store error.
    pub fatal: Arc<Notify>,
}

impl AppState {
    pub fn new(registry: Arc<QueueRegistry>, fatal: Arc<Notify>) -> Self {
        Self { registry, fatal }
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, ApiError> {
        self.registry.get(name).map_err(ApiError)
    }

    /// Pass `result` through, raising the shutdown signal on fatal errors.
    fn check<T>(&self, result: netsched_core::Result<T>) -> Result<T, ApiError> {
        result.map_err(|e| {
            if e.is_fatal() {
                tracing::error!(error = %e, "Fatal store error, requesting shutdown");
                self.fatal.notify_one();
            }
            ApiError(e)
        })
    }
}

/// Engine error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub NsError);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<NsError> for ApiError {
    fn from(e: NsError) -> Self {
        Self(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            NsError::JobNotFound(_) | NsError::QueueNotFound(_) => StatusCode::NOT_FOUND,
            NsError::AccessDenied(_) => StatusCode::FORBIDDEN,
            NsError::InvalidInput(_) | NsError::Config(_) => StatusCode::BAD_REQUEST,
            NsError::Conflict(_) | NsError::RetryExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiResponse {
            success: false,
            message: self.0.to_string(),
        })
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Generic API response.
#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<String>,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: JobId,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<JobSubmission>,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub ids: Vec<JobId>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub id: JobId,
    pub status: JobStatus,
}

#[derive(Serialize)]
pub struct OutcomeResponse {
    pub id: JobId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Serialize)]
pub struct DumpResponse {
    pub jobs: Vec<JobDescription>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct CountResponse {
    pub status: JobStatus,
    pub count: usize,
}

#[derive(Serialize)]
pub struct IdsResponse {
    pub status: JobStatus,
    pub ids: Vec<JobId>,
}

#[derive(Serialize)]
pub struct TruncateResponse {
    pub removed: u64,
}

#[derive(Serialize)]
pub struct CanceledResponse {
    pub canceled: usize,
}

#[derive(Serialize)]
pub struct ProgressResponse {
    pub id: JobId,
    pub message: String,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub job: Option<DispatchedJob>,
}

#[derive(Serialize)]
pub struct ExchangeResponse {
    pub done: OutcomeResponse,
    pub job: Option<DispatchedJob>,
}

#[derive(Serialize)]
pub struct ListenerResponse {
    pub registered: bool,
}

/// Query selecting one status (`?status=pending`).
#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(deserialize_with = "status_param")]
    pub status: JobStatus,
}

/// Optional status filter for dumps and descriptions.
#[derive(Deserialize)]
pub struct FilterQuery {
    #[serde(default, deserialize_with = "optional_status_param")]
    pub status: Option<JobStatus>,
}

fn status_param<'de, D>(deserializer: D) -> Result<JobStatus, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn optional_status_param<'de, D>(deserializer: D) -> Result<Option<JobStatus>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    status_param(deserializer).map(Some)
}

/// Worker fetch request.
#[derive(Deserialize)]
pub struct GetRequest {
    /// Worker notification port, part of the worker identity.
    pub port: u16,
    #[serde(default)]
    pub affinity: Vec<String>,
    /// Seconds to wait for work; 0 returns immediately.
    #[serde(default)]
    pub wait: u64,
    /// Port for NCID datagrams while waiting; 0 disables them.
    #[serde(default)]
    pub listener_port: u16,
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
    pub port: u16,
    pub done_id: JobId,
    #[serde(default)]
    pub return_code: i32,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub affinity: Vec<String>,
}

#[derive(Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub return_code: i32,
    #[serde(default)]
    pub output: String,
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub error: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub return_code: i32,
}

#[derive(Deserialize)]
pub struct RunTimeoutRequest {
    pub seconds: u64,
}

#[derive(Deserialize)]
pub struct ProgressRequest {
    pub message: String,
}

#[derive(Deserialize)]
pub struct ListenerRequest {
    pub port: u16,
    pub ttl: u64,
    #[serde(default)]
    pub auth: String,
}

/// Host of the calling peer, used for allow-list checks.
fn caller_host(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .service(
                web::scope("/api")
                    .route("/queues", web::get().to(list_queues))
                    .route("/queues/{queue}/stats", web::get().to(statistics))
                    .route("/queues/{queue}/config", web::put().to(reconfigure))
                    .route("/queues/{queue}/counts", web::get().to(count_by_status))
                    .route("/queues/{queue}/ids", web::get().to(jobs_with_status))
                    .route("/queues/{queue}/cancel", web::post().to(cancel_all))
                    .route("/queues/{queue}/get", web::post().to(get_job))
                    .route("/queues/{queue}/exchange", web::post().to(job_exchange))
                    .route("/queues/{queue}/listeners", web::post().to(register_listener))
                    .route(
                        "/queues/{queue}/listeners/{port}",
                        web::delete().to(unregister_listener),
                    )
                    .route("/queues/{queue}/jobs", web::post().to(submit))
                    .route("/queues/{queue}/jobs", web::get().to(dump))
                    .route("/queues/{queue}/jobs", web::delete().to(truncate))
                    .route("/queues/{queue}/jobs/batch", web::post().to(submit_batch))
                    .route("/queues/{queue}/jobs/{id}", web::get().to(describe))
                    .route("/queues/{queue}/jobs/{id}", web::delete().to(drop_job))
                    .route("/queues/{queue}/jobs/{id}/status", web::get().to(status))
                    .route("/queues/{queue}/jobs/{id}/put", web::post().to(put))
                    .route("/queues/{queue}/jobs/{id}/fail", web::post().to(put_failure))
                    .route("/queues/{queue}/jobs/{id}/cancel", web::post().to(cancel))
                    .route("/queues/{queue}/jobs/{id}/return", web::post().to(return_job))
                    .route(
                        "/queues/{queue}/jobs/{id}/reschedule",
                        web::post().to(force_reschedule),
                    )
                    .route(
                        "/queues/{queue}/jobs/{id}/run-timeout",
                        web::put().to(set_run_timeout),
                    )
                    .route(
                        "/queues/{queue}/jobs/{id}/progress",
                        web::put().to(put_progress),
                    )
                    .route(
                        "/queues/{queue}/jobs/{id}/progress",
                        web::get().to(get_progress),
                    ),
            ),
    );
}

// ========== Queues ==========

/// Health check endpoint.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

async fn list_queues(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(QueuesResponse {
        queues: state.registry.list(),
    })
}

async fn statistics(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let queue = state.queue(&path)?;
    Ok(HttpResponse::Ok().json(queue.statistics()))
}

async fn reconfigure(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<QueueConfig>,
) -> ApiResult {
    let mut config = body.into_inner();
    config.name = path.into_inner();
    state.registry.reconfigure(config.clone())?;
    tracing::info!(queue = %config.name, "Queue reconfigured");
    Ok(HttpResponse::Ok().json(ApiResponse {
        success: true,
        message: format!("Queue {} reconfigured", config.name),
    }))
}

async fn count_by_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    Ok(HttpResponse::Ok().json(CountResponse {
        status: query.status,
        count: queue.count_by_status(query.status),
    }))
}

async fn jobs_with_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    Ok(HttpResponse::Ok().json(IdsResponse {
        status: query.status,
        ids: queue.jobs_with_status(query.status),
    }))
}

async fn cancel_all(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let canceled = state.check(
        queue
            .cancel_all_with_status(&caller_host(&req), query.status)
            .await,
    )?;
    Ok(HttpResponse::Ok().json(CanceledResponse { canceled }))
}

async fn dump(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<FilterQuery>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let jobs = state.check(queue.dump(query.status).await)?;
    let total = jobs.len();
    Ok(HttpResponse::Ok().json(DumpResponse { jobs, total }))
}

async fn truncate(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let queue = state.queue(&path)?;
    let removed = state.check(queue.truncate().await)?;
    Ok(HttpResponse::Ok().json(TruncateResponse { removed }))
}

async fn register_listener(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ListenerRequest>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let registered = queue.register_listener(&caller_host(&req), body.port, body.ttl, &body.auth);
    Ok(HttpResponse::Ok().json(ListenerResponse { registered }))
}

async fn unregister_listener(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u16)>,
) -> ApiResult {
    let (name, port) = path.into_inner();
    let queue = state.queue(&name)?;
    let registered = queue.unregister_listener(&caller_host(&req), port);
    Ok(HttpResponse::Ok().json(ListenerResponse { registered }))
}

// ========== Submitters ==========

async fn submit(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<JobSubmission>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let id = state.check(queue.submit(&caller_host(&req), body.into_inner()).await)?;
    Ok(HttpResponse::Ok().json(SubmitResponse { id }))
}

async fn submit_batch(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<BatchRequest>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let ids = state.check(
        queue
            .submit_batch(&caller_host(&req), body.into_inner().jobs)
            .await,
    )?;
    Ok(HttpResponse::Ok().json(BatchResponse { ids }))
}

async fn describe(
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
    query: web::Query<FilterQuery>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let description = state.check(queue.job_description(JobId(id), query.status).await)?;
    Ok(HttpResponse::Ok().json(description))
}

async fn status(state: web::Data<AppState>, path: web::Path<(String, u64)>) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let status = state.check(queue.get_status(JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(StatusResponse {
        id: JobId(id),
        status,
    }))
}

async fn cancel(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(queue.cancel(&caller_host(&req), JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}

async fn drop_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    state.check(queue.drop_job(&caller_host(&req), JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(ApiResponse {
        success: true,
        message: format!("Job {} dropped", id),
    }))
}

async fn get_progress(state: web::Data<AppState>, path: web::Path<(String, u64)>) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let message = state.check(queue.get_progress_message(JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(ProgressResponse {
        id: JobId(id),
        message,
    }))
}

async fn put_progress(
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
    body: web::Json<ProgressRequest>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    state.check(queue.put_progress_message(JobId(id), &body.message).await)?;
    Ok(HttpResponse::Ok().json(ApiResponse {
        success: true,
        message: format!("Progress of job {} updated", id),
    }))
}

// ========== Workers ==========

async fn get_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<GetRequest>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let worker = WorkerNode::new(caller_host(&req), body.port);
    let job = if body.wait > 0 {
        queue
            .wait_get(
                &worker,
                &body.affinity,
                body.listener_port,
                Duration::from_secs(body.wait),
            )
            .await
    } else {
        queue.get_job(&worker, &body.affinity).await
    };
    let job = state.check(job)?;
    Ok(HttpResponse::Ok().json(JobResponse { job }))
}

async fn job_exchange(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ExchangeRequest>,
) -> ApiResult {
    let queue = state.queue(&path)?;
    let worker = WorkerNode::new(caller_host(&req), body.port);
    let (outcome, job) = state.check(
        queue
            .job_exchange(
                &worker,
                body.done_id,
                body.return_code,
                &body.output,
                &body.affinity,
            )
            .await,
    )?;
    Ok(HttpResponse::Ok().json(ExchangeResponse {
        done: OutcomeResponse {
            id: body.done_id,
            outcome,
        },
        job,
    }))
}

async fn put(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
    body: web::Json<PutRequest>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(
        queue
            .put(&caller_host(&req), JobId(id), body.return_code, &body.output)
            .await,
    )?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}

async fn put_failure(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
    body: web::Json<FailRequest>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(
        queue
            .put_failure(
                &caller_host(&req),
                JobId(id),
                &body.error,
                &body.output,
                body.return_code,
            )
            .await,
    )?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}

async fn return_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(queue.return_job(&caller_host(&req), JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}

async fn force_reschedule(state: web::Data<AppState>, path: web::Path<(String, u64)>) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(queue.force_reschedule(JobId(id)).await)?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}

async fn set_run_timeout(
    state: web::Data<AppState>,
    path: web::Path<(String, u64)>,
    body: web::Json<RunTimeoutRequest>,
) -> ApiResult {
    let (name, id) = path.into_inner();
    let queue = state.queue(&name)?;
    let outcome = state.check(queue.set_job_run_timeout(JobId(id), body.seconds).await)?;
    Ok(HttpResponse::Ok().json(OutcomeResponse {
        id: JobId(id),
        outcome,
    }))
}
