use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use color_eyre::eyre::Result;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::{json, Value};
use testbay::center::JobCenter;
use testbay::error::LabError;
use testbay::inventory::{Inventory, ProfileFiles, PROFILE_FILES};
use testbay::job::{ArtifactRef, JobRecord, Step};
use testbay::log::*;
use testbay::planner::PlanStatus;
use testbay::profile::COOKIE_PLACEHOLDER;
use testbay::testplan::{JobRequest, Testplan};
use testbay::testsuite::Testsuite;

/// Profile uploads carry kernels and initrds.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    center: Arc<JobCenter>,
    inventory: Arc<Inventory>,
    primary_profile: String,
}

impl AppState {
    pub fn new(center: JobCenter, inventory: Inventory, primary_profile: String) -> Self {
        Self {
            center: Arc::new(center),
            inventory: Arc::new(inventory),
            primary_profile,
        }
    }
}

/// Library errors on their way out to HTTP clients.
pub struct ApiError(LabError);

impl<E: Into<LabError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn status_for(err: &LabError) -> StatusCode {
    match err {
        LabError::NotFound { .. } | LabError::NoTestsuite(_) => StatusCode::NOT_FOUND,
        LabError::InvalidRequest(_)
        | LabError::InvalidName(_)
        | LabError::InvalidPayload(_)
        | LabError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        LabError::StepMismatch { .. }
        | LabError::AlreadyTerminal { .. }
        | LabError::CookieConflict(_) => StatusCode::CONFLICT,
        LabError::UnknownBackend(_) => StatusCode::BAD_REQUEST,
        LabError::Backend { .. } => StatusCode::BAD_GATEWAY,
        LabError::Io(_) | LabError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if self.0.is_stale_callback() {
            warn!("controller: stale callback: {}", self.0);
        } else if status.is_server_error() {
            error!("controller: {}", self.0);
        } else {
            debug!("controller: request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/jobs", get(list_jobs))
        .route("/jobs/submit/:suite/with/:profile/on/:host", get(submit_job))
        .route("/jobs/submit/:suite/with/:profile/on/:host/:cookie", get(submit_job))
        .route("/jobs/:cookie", get(show_job).delete(abort_job))
        .route("/jobs/:cookie/provision", get(provision_job))
        .route("/jobs/:cookie/start", get(start_job))
        .route("/jobs/:cookie/step/:n", get(step_result))
        .route("/jobs/:cookie/step/:n/finish/:result", get(finish_step))
        .route("/jobs/:cookie/step/:n/skip", get(skip_step))
        .route("/jobs/:cookie/annotate", put(annotate))
        .route("/jobs/:cookie/abort", get(abort_job))
        .route("/jobs/:cookie/artifacts", get(list_artifacts))
        .route("/jobs/:cookie/artifacts.tar.gz", get(artifacts_archive))
        .route("/jobs/:cookie/artifacts/:name", get(get_artifact).put(add_artifact))
        .route("/jobs/:cookie/testsuite.tar.gz", get(job_testsuite_archive))
        .route("/jobs/:cookie/bootstrap", get(bootstrap))
        .route("/jobs/:cookie/pxe/disable", get(disable_pxe))
        .route("/testsuites", get(list_testsuites))
        .route("/testsuites/validate", get(validate_testsuites))
        .route("/testsuites/:name", get(show_testsuite))
        .route("/testsuites/:name/archive", get(testsuite_archive))
        .route("/testsuites/:name/:set/:case/source", get(testcase_source))
        .route("/testplans", get(list_testplans))
        .route("/testplans/:name", get(show_testplan))
        .route("/testplans/:name/submit", get(submit_testplan))
        .route("/testplans/:name/status", get(testplan_status))
        .route("/testplans/:name/abort", get(abort_testplan))
        .route("/profiles", get(list_profiles))
        .route("/profiles/:name", put(upload_profile).delete(delete_profile))
        .route("/profiles/:name/kargs", get(profile_kargs))
        .route("/hosts", get(list_hosts))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<()> {
    info!("controller: listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| e.into())
}

async fn root() -> &'static str {
    "testbay-controller"
}

fn binary(content_type: &'static str, data: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, content_type)], data).into_response()
}

fn parse_result(result: &str) -> std::result::Result<bool, LabError> {
    match result {
        "true" | "success" | "passed" => Ok(true),
        "false" | "failure" | "failed" => Ok(false),
        other => Err(LabError::InvalidRequest(format!("bad step result '{other}'"))),
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(state.center.get_jobs().await)
}

#[derive(Deserialize)]
struct SubmitPath {
    suite: String,
    profile: String,
    host: String,
    #[serde(default)]
    cookie: Option<String>,
}

#[derive(Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    additional_kargs: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Path(path): Path<SubmitPath>,
    Query(query): Query<SubmitQuery>,
) -> ApiResult<Json<JobRecord>> {
    let request = JobRequest::new(path.suite, path.profile, path.host, query.additional_kargs);
    let spec = state.inventory.resolve(&request).await?;
    Ok(Json(state.center.submit(spec, path.cookie).await?))
}

async fn show_job(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.center.job(&cookie).await?))
}

async fn provision_job(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state.center.provision_job(&cookie).await?;
    Ok(Json(state.center.job(&cookie).await?))
}

async fn start_job(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.center.start_job(&cookie).await?))
}

async fn step_result(
    State(state): State<AppState>,
    Path((cookie, n)): Path<(String, usize)>,
) -> ApiResult<Json<Step>> {
    Ok(Json(state.center.step_result(&cookie, n).await?))
}

#[derive(Deserialize)]
struct FinishQuery {
    detail: Option<String>,
}

async fn finish_step(
    State(state): State<AppState>,
    Path((cookie, n, result)): Path<(String, usize, String)>,
    Query(query): Query<FinishQuery>,
) -> ApiResult<Json<JobRecord>> {
    let success = parse_result(&result)?;
    Ok(Json(
        state
            .center
            .finish_test_step(&cookie, n, success, query.detail)
            .await?,
    ))
}

async fn skip_step(
    State(state): State<AppState>,
    Path((cookie, n)): Path<(String, usize)>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.center.skip_step(&cookie, n).await?))
}

async fn annotate(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.center.annotate(&cookie, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn abort_job(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.center.abort_job(&cookie).await?))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<Vec<ArtifactRef>>> {
    Ok(Json(state.center.list_artifacts(&cookie).await?))
}

async fn artifacts_archive(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Response> {
    Ok(match state.center.artifacts_archive(&cookie).await? {
        Some(archive) => binary("application/gzip", archive),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((cookie, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let data = state.center.get_artifact(&cookie, &name).await?;
    Ok(binary("application/octet-stream", data))
}

async fn add_artifact(
    State(state): State<AppState>,
    Path((cookie, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<ArtifactRef>> {
    Ok(Json(
        state
            .center
            .add_artifact(&cookie, &name, body.to_vec())
            .await?,
    ))
}

async fn job_testsuite_archive(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Response> {
    let archive = state.center.testsuite_archive(&cookie).await?;
    Ok(binary("application/gzip", archive))
}

async fn bootstrap(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Response> {
    let script = state.center.bootstrap_script(&cookie).await?;
    Ok(([(header::CONTENT_TYPE, "text/x-shellscript")], script).into_response())
}

async fn disable_pxe(
    State(state): State<AppState>,
    Path(cookie): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state.center.disable_pxe(&cookie).await?;
    Ok(Json(state.center.job(&cookie).await?))
}

async fn list_testsuites(State(state): State<AppState>) -> Json<Vec<Arc<Testsuite>>> {
    Json(state.inventory.testsuites().await.into_values().collect())
}

async fn validate_testsuites(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(
        state
            .inventory
            .testsuites()
            .await
            .into_iter()
            .map(|(name, suite)| (name, suite.validate()))
            .collect(),
    )
}

async fn show_testsuite(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Arc<Testsuite>>> {
    Ok(Json(state.inventory.testsuite(&name).await?))
}

async fn testsuite_archive(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let archive = state.inventory.testsuite(&name).await?.archive()?;
    Ok(binary("application/gzip", archive))
}

async fn testcase_source(
    State(state): State<AppState>,
    Path((name, set, case)): Path<(String, String, String)>,
) -> ApiResult<String> {
    let suite = state.inventory.testsuite(&name).await?;
    let testcase = suite
        .find_testcase(&set, &case)
        .ok_or_else(|| LabError::not_found("testcase", format!("{name}/{set}/{case}")))?;
    Ok(testcase.source().clone())
}

async fn list_testplans(State(state): State<AppState>) -> Json<Vec<Arc<Testplan>>> {
    Json(state.inventory.plans().await.into_values().collect())
}

async fn show_testplan(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Arc<Testplan>>> {
    Ok(Json(state.inventory.plan(&name).await?))
}

async fn submit_testplan(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(overrides): Query<BTreeMap<String, String>>,
) -> ApiResult<Json<PlanStatus>> {
    let plan = state.inventory.plan(&name).await?;
    Ok(Json(
        state
            .center
            .submit_plan(&state.inventory, &plan, &overrides)
            .await?,
    ))
}

async fn testplan_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PlanStatus>> {
    Ok(Json(state.center.status_plan(&name).await?))
}

async fn abort_testplan(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PlanStatus>> {
    Ok(Json(state.center.abort_plan(&name).await?))
}

async fn list_profiles(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(
        state
            .inventory
            .profiles()
            .await
            .values()
            .map(|profile| profile.describe())
            .collect(),
    )
}

/// Extract the profile files from a (possibly gzipped) tarball into `dir`.
/// Only the base name of each entry counts.
fn unpack_profile(body: &[u8], dir: &FsPath) -> std::result::Result<ProfileFiles, LabError> {
    let payload = |e: io::Error| LabError::InvalidPayload(format!("bad profile archive: {e}"));
    let reader: Box<dyn Read + '_> = if body.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(body))
    } else {
        Box::new(body)
    };
    let mut archive = tar::Archive::new(reader);
    let mut files = ProfileFiles::new();
    for entry in archive.entries().map_err(payload)? {
        let mut entry = entry.map_err(payload)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(payload)?.into_owned();
        let Some(role) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !PROFILE_FILES.contains(&role) {
            debug!("controller: ignoring {} in profile upload", path.display());
            continue;
        }
        let target = dir.join(role);
        entry.unpack(&target).map_err(payload)?;
        files.insert(role.to_string(), target);
    }
    Ok(files)
}

async fn upload_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let staging = tempfile::tempdir()?;
    let dir = staging.path().to_path_buf();
    let files = tokio::task::spawn_blocking(move || unpack_profile(&body, &dir))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    state
        .inventory
        .create_profile(&state.primary_profile, &name, &files)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn delete_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.inventory.delete_profile(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct KargsQuery {
    #[serde(default)]
    kargs: String,
}

async fn profile_kargs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<KargsQuery>,
) -> ApiResult<Json<Value>> {
    let profile = state.inventory.profile(&name).await?;
    let kargs = profile.kargs(&query.kargs);
    if !kargs.contains(COOKIE_PLACEHOLDER) {
        return Err(LabError::PreconditionFailed(format!(
            "kernel arguments of profile '{name}' lack {COOKIE_PLACEHOLDER}"
        ))
        .into());
    }
    Ok(Json(json!({
        "profile": name,
        "kargs": kargs,
    })))
}

async fn list_hosts(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(
        state
            .inventory
            .hosts()
            .await
            .values()
            .map(|host| host.describe())
            .collect(),
    )
}
