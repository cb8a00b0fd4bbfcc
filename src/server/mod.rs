//! REST + SSE surface over the queue manager.

pub mod guard;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::ForgeError;
use crate::job::{JobEvent, JobId};
use crate::queue::QueueManager;

const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<QueueManager>,
    pub cfg: Arc<Config>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/jobs", post(submit_job).get(list_jobs))
        .route("/v1/jobs/:id", get(get_job))
        .route("/v1/jobs/:id/log", get(get_log))
        .route("/v1/jobs/:id/tail", get(get_tail))
        .route("/v1/jobs/:id/diagnostics", get(get_diagnostics))
        .route("/v1/jobs/:id/events", get(get_events))
        .route("/v1/jobs/:id/artifacts", get(get_artifacts))
        .route("/v1/jobs/:id/resubmit", post(resubmit_job))
        .route("/v1/history/recent", get(recent_history))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guard::require_access,
        ))
        .layer(DefaultBodyLimit::max(state.cfg.max_upload_bytes as usize));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API error with a JSON `{"error": ...}` body.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "job not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        let status = match &err {
            ForgeError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::JobNotTerminal(_) => StatusCode::CONFLICT,
            ForgeError::InvalidBundle(_) | ForgeError::Archive(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), err.body_text())
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).ok_or_else(ApiError::not_found)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut bundle = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("bundle") {
            bundle = Some(field.bytes().await.map_err(multipart_error)?);
        }
    }
    let bundle = bundle
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing bundle file field"))?;

    let record = state.manager.submit(&bundle).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": record.id,
            "state": record.state,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListJobsParams {
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Response, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let items = state.manager.list_jobs(limit).await;
    Ok(Json(json!({ "items": items })).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let record = state.manager.get(&id).await.ok_or_else(ApiError::not_found)?;
    Ok(Json(record).into_response())
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    if state.manager.get(&id).await.is_none() {
        return Err(ApiError::not_found());
    }
    let raw = state
        .manager
        .read_console_log(&id)
        .await
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))?;
    Ok(plain_text(raw))
}

#[derive(Debug, Deserialize)]
struct TailParams {
    lines: Option<usize>,
}

async fn get_tail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TailParams>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    if state.manager.get(&id).await.is_none() {
        return Err(ApiError::not_found());
    }
    let raw = state
        .manager
        .read_console_tail(&id, params.lines.unwrap_or(0))
        .await
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))?;
    Ok(plain_text(raw))
}

async fn get_diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    if state.manager.get(&id).await.is_none() {
        return Err(ApiError::not_found());
    }
    let raw = state
        .manager
        .read_diagnostics(&id)
        .await
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        raw,
    )
        .into_response())
}

async fn get_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let payload = state.manager.download_artifacts(&id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}-artifacts.zip\""),
            ),
        ],
        payload,
    )
        .into_response())
}

async fn resubmit_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let record = state.manager.resubmit(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": record.id,
            "resubmit_of": id,
            "state": record.state,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct RecentHistoryParams {
    limit: Option<usize>,
}

async fn recent_history(
    State(state): State<AppState>,
    Query(params): Query<RecentHistoryParams>,
) -> Result<Response, ApiError> {
    let limit = params
        .limit
        .unwrap_or(20)
        .clamp(1, state.manager.history_limit());
    let items = state.manager.recent_history(limit).await?;
    Ok(Json(json!({ "items": items })).into_response())
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    since: Option<i64>,
}

struct EventStreamState {
    backlog: std::vec::IntoIter<JobEvent>,
    live: Option<broadcast::Receiver<JobEvent>>,
    shutdown: CancellationToken,
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<EventsParams>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let since = params.since.unwrap_or(0);
    let subscription = state
        .manager
        .subscribe_events(&id, since)
        .await
        .ok_or_else(ApiError::not_found)?;

    let stream_state = EventStreamState {
        backlog: subscription.backlog.into_iter(),
        live: subscription.live,
        shutdown: state.shutdown.clone(),
    };

    // Backlog first, then live events until the terminal event, a lost
    // subscription, or server shutdown. Lagged receivers skip dropped
    // non-terminal events and keep going.
    let stream = stream::unfold(stream_state, |mut st| async move {
        if let Some(event) = st.backlog.next() {
            let terminal = event.is_terminal();
            let frame = sse_frame(&event);
            if terminal {
                st.live = None;
            }
            return Some((frame, st));
        }
        loop {
            let Some(rx) = st.live.as_mut() else {
                return None;
            };
            let received = tokio::select! {
                _ = st.shutdown.cancelled() => None,
                res = rx.recv() => Some(res),
            };
            match received {
                None => return None,
                Some(Ok(event)) => {
                    let terminal = event.is_terminal();
                    let frame = sse_frame(&event);
                    if terminal {
                        st.live = None;
                    }
                    return Some((frame, st));
                }
                Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "Subscriber lagged; dropping events");
                    continue;
                }
                Some(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    });

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}

fn sse_frame(event: &JobEvent) -> Result<SseEvent, axum::Error> {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.to_string())
        .json_data(event)
}

fn plain_text(raw: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], raw).into_response()
}
