//! Router, handlers, and error translation of the proxy API.
//!
//! Every data route authenticates the caller and touches exactly one
//! namespace: the one derived from the caller's identity. Submissions run
//! through the core pipeline (merge, parse, patch, submit); reads, lists,
//! deletes and log relays go straight to the cluster.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use kbatch_core::{
    client::{ClusterClient, Error as ClusterError},
    merge::merge_json_objects,
    patch::{self, PatchOptions},
    submit::{Error as SubmitError, Submission, Submitter},
    workload::{self, Error as WorkloadError, ResourceKind, Workload},
};
use serde::Deserialize;
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{
    auth::{self, Authenticator, Error as AuthError, User},
    config::{Profile, Settings},
};

/// Ceiling for one request/response exchange; log streams are only bounded
/// by either side closing.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a handler needs, built once at startup and shared read-only.
pub struct AppContext {
    pub settings: Settings,
    pub job_template: Option<Value>,
    pub profiles: BTreeMap<String, Profile>,
    pub authenticator: Arc<dyn Authenticator>,
    pub cluster: Arc<dyn ClusterClient>,
    pub submitter: Submitter,
}

impl AppContext {
    pub fn new(
        settings: Settings,
        job_template: Option<Value>,
        profiles: BTreeMap<String, Profile>,
        authenticator: Arc<dyn Authenticator>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let submitter = Submitter::new(
            Arc::clone(&cluster),
            settings.kbatch_create_user_namespace,
        );
        Self {
            settings,
            job_template,
            profiles,
            authenticator,
            cluster,
            submitter,
        }
    }
}

type AppState = Arc<AppContext>;

/// Uniform wire shape for failures: `{"status": <code>, "detail": <why>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Incorrect token")
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": self.status.as_u16(),
            "detail": self.detail,
        }));
        (self.status, body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match &error {
            AuthError::MissingCredentials | AuthError::InvalidToken => Self::unauthenticated(),
            AuthError::MissingScope { .. } => Self::new(StatusCode::FORBIDDEN, error.to_string()),
            AuthError::Hub { .. } | AuthError::HubStatus { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, error.to_string())
            }
        }
    }
}

impl From<WorkloadError> for ApiError {
    fn from(error: WorkloadError) -> Self {
        let status = if error.is_too_large() {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::BAD_REQUEST
        };
        Self::new(status, error.to_string())
    }
}

impl From<patch::Error> for ApiError {
    fn from(error: patch::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error.to_string())
    }
}

impl From<ClusterError> for ApiError {
    fn from(error: ClusterError) -> Self {
        match error {
            // client-attributable cluster answers are relayed as-is, the
            // rest surfaces as a bad gateway
            ClusterError::Api { status, message } if status < 500 => Self::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            ),
            ClusterError::Api { message, .. } => Self::new(StatusCode::BAD_GATEWAY, message),
            error @ ClusterError::Transport { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, error.to_string())
            }
            error => Self::internal(error.to_string()),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error.cluster_source() {
            Some(ClusterError::Api { status, message }) if *status < 500 => Self::new(
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message.clone(),
            ),
            Some(source) => Self::new(StatusCode::BAD_GATEWAY, format!("{error}: {source}")),
            None => Self::internal(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::internal(error.to_string())
    }
}

impl FromRequestParts<AppState> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(auth::bearer_token)
            .ok_or(AuthError::MissingCredentials)?;
        let user = state.authenticator.authenticate(token).await?;
        Ok(user)
    }
}

/// Builds the full application router, mounted under the configured prefix.
pub fn build_router(context: AppState) -> Router {
    let api = Router::new()
        .route("/", get(root))
        .route("/authorized", get(authorized))
        .route("/profiles/", get(profiles))
        .route("/jobs/", get(list_jobs).post(create_job))
        .route("/jobs/{name}", get(read_job).delete(delete_job))
        .route("/jobs/logs/{name}/", get(job_logs))
        .route("/cronjobs/", get(list_cron_jobs).post(create_cron_job))
        .route(
            "/cronjobs/{name}",
            get(read_cron_job).delete(delete_cron_job),
        )
        .route("/pods/", get(list_pods))
        .route("/pods/{name}", get(read_pod))
        .route("/pods/logs/{name}/", get(pod_logs))
        .with_state(Arc::clone(&context));

    let prefix = context.settings.kbatch_prefix.clone();
    let router = if prefix.is_empty() {
        api
    } else {
        // keep a bare responder at the root so health probes in front of the
        // prefix keep working
        Router::new().nest(&prefix, api).route("/", get(root))
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[derive(Debug, Snafu)]
pub enum ServeError {
    #[snafu(display("failed to bind {address}"))]
    Bind {
        source: std::io::Error,
        address: std::net::SocketAddr,
    },

    #[snafu(display("the HTTP server failed"))]
    Serve { source: std::io::Error },
}

/// Binds the configured address and serves until SIGINT/SIGTERM.
pub async fn serve(context: AppState) -> Result<(), ServeError> {
    let address = context.settings.kbatch_bind_address;
    let router = build_router(context);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(%address, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu)
}

async fn shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("create SIGINT listener");
    let mut sigterm = signal(SignalKind::terminate()).expect("create SIGTERM listener");
    tokio::select! {
        _ = sigint.recv() => debug!("received SIGINT"),
        _ = sigterm.recv() => debug!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// handlers

async fn root() -> Json<Value> {
    Json(json!({"message": "kbatch"}))
}

async fn authorized(user: User) -> Json<Value> {
    Json(json!({"name": user.name, "groups": user.groups}))
}

async fn profiles(State(context): State<AppState>) -> Json<BTreeMap<String, Profile>> {
    Json(context.profiles.clone())
}

async fn create_job(
    State(context): State<AppState>,
    user: User,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    submit_workload(&context, &user, &body, ResourceKind::Job).await
}

async fn create_cron_job(
    State(context): State<AppState>,
    user: User,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    submit_workload(&context, &user, &body, ResourceKind::CronJob).await
}

async fn submit_workload(
    context: &AppContext,
    user: &User,
    body: &Value,
    kind: ResourceKind,
) -> Result<Json<Value>, ApiError> {
    let job_data = body
        .get("job")
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "the body must carry a job"))?;

    // normalize before merging so both sides speak the canonical spelling
    // and the template reliably wins
    let mut job_data = workload::normalize_keys(job_data);
    if let Some(template) = &context.job_template {
        job_data = merge_json_objects(&job_data, template);
    }

    let mut workload = match kind {
        ResourceKind::Job => Workload::Job(workload::parse_job(&job_data)?),
        ResourceKind::CronJob => Workload::CronJob(workload::parse_cron_job(&job_data)?),
    };
    workload::validate(&workload)?;

    let mut config_map = body
        .get("code")
        .map(|code| workload::parse_code_config_map(code, context.settings.kbatch_code_max_bytes))
        .transpose()?;

    let options = PatchOptions {
        username: user.name.clone(),
        api_token: user.api_token.clone(),
        extra_env: context
            .settings
            .kbatch_job_extra_env
            .clone()
            .unwrap_or_default(),
        ttl_seconds_after_finished: Some(context.settings.kbatch_job_ttl_seconds_after_finished),
    };
    let secret = patch::patch(&mut workload, config_map.as_mut(), &options)?;

    let created = context
        .submitter
        .submit(Submission {
            workload,
            secret,
            config_map,
            namespace: user.namespace(),
        })
        .await?;
    Ok(Json(created.to_value()?))
}

async fn read_job(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = context.cluster.read_job(&user.namespace(), &name).await?;
    Ok(Json(serde_json::to_value(job)?))
}

async fn list_jobs(
    State(context): State<AppState>,
    user: User,
) -> Result<Json<Value>, ApiError> {
    let jobs = context.cluster.list_jobs(&user.namespace()).await?;
    Ok(Json(serde_json::to_value(jobs)?))
}

async fn delete_job(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = context.cluster.delete_job(&user.namespace(), &name).await?;
    Ok(Json(status))
}

async fn read_cron_job(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cron_job = context
        .cluster
        .read_cron_job(&user.namespace(), &name)
        .await?;
    Ok(Json(serde_json::to_value(cron_job)?))
}

async fn list_cron_jobs(
    State(context): State<AppState>,
    user: User,
) -> Result<Json<Value>, ApiError> {
    let cron_jobs = context.cluster.list_cron_jobs(&user.namespace()).await?;
    Ok(Json(serde_json::to_value(cron_jobs)?))
}

async fn delete_cron_job(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = context
        .cluster
        .delete_cron_job(&user.namespace(), &name)
        .await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct PodsQuery {
    job_name: Option<String>,
}

async fn list_pods(
    State(context): State<AppState>,
    user: User,
    Query(query): Query<PodsQuery>,
) -> Result<Json<Value>, ApiError> {
    let selector = query.job_name.map(|name| format!("job-name={name}"));
    let pods = context
        .cluster
        .list_pods(&user.namespace(), selector.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(pods)?))
}

async fn read_pod(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pod = context.cluster.read_pod(&user.namespace(), &name).await?;
    Ok(Json(serde_json::to_value(pod)?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    stream: bool,
}

async fn pod_logs(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    relay_pod_log(&context, &user.namespace(), &name, query.stream).await
}

/// Logs for a Job are the logs of its first pod, found via the `job-name`
/// label the cluster stamps on job pods.
async fn job_logs(
    State(context): State<AppState>,
    user: User,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let namespace = user.namespace();
    let selector = format!("job-name={name}");
    let pods = context
        .cluster
        .list_pods(&namespace, Some(&selector))
        .await?;
    let pod_name = pods
        .items
        .first()
        .and_then(|pod| pod.metadata.name.clone())
        .ok_or_else(|| ApiError::not_found(format!("no pods found for job {name:?}")))?;
    relay_pod_log(&context, &namespace, &pod_name, query.stream).await
}

async fn relay_pod_log(
    context: &AppContext,
    namespace: &str,
    pod_name: &str,
    stream: bool,
) -> Result<Response, ApiError> {
    if stream {
        let upstream = context.cluster.stream_pod_log(namespace, pod_name).await?;
        // an upstream failure after the headers went out ends the stream
        let body = Body::from_stream(
            upstream.take_while(|chunk| std::future::ready(chunk.is_ok())),
        );
        Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response())
    } else {
        let log = context.cluster.read_pod_log(namespace, pod_name).await?;
        Ok(log.into_response())
    }
}
