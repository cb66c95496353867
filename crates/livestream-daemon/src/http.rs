use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use livestream_proto::error::StreamError;
use livestream_proto::protocol::{
    Command, CoreState, Event, NoticeCategory, Reply, StreamQuery, StreamStatus,
};
use livestream_proto::record::StreamRecord;
use livestream_proto::store::filter_records;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::core::CoreHandle;

#[derive(Clone)]
struct HttpState {
    core: CoreHandle,
}

#[derive(Serialize)]
struct StreamRow {
    index: usize,
    status: Option<StreamStatus>,
    #[serde(flatten)]
    record: StreamRecord,
}

#[derive(Deserialize, Default)]
struct LoadBody {
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct SaveBody {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    backup: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    category: NoticeCategory,
    message: String,
}

/// `StreamError` rendered as `{category, message}` with a matching status.
struct ApiError(StreamError);

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StreamError::Validation { .. }
            | StreamError::NoSelection
            | StreamError::EmptyUrl
            | StreamError::NoData(_) => StatusCode::BAD_REQUEST,
            StreamError::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
            StreamError::FileExists(_) => StatusCode::CONFLICT,
            StreamError::EngineUnavailable(_) | StreamError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StreamError::Persistence { .. } | StreamError::Playback(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            category: self.0.category(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(core: CoreHandle) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/streams", get(list_streams).post(add_stream))
        .route("/api/streams/:idx", put(update_stream).delete(delete_stream))
        .route("/api/load", post(load))
        .route("/api/save", post(save))
        .route("/api/play/:idx", post(play))
        .route("/api/stop", post(stop))
        .route("/api/check/:idx", post(check))
        .route("/api/check-all", post(check_all))
        .route("/api/check-all/cancel", post(cancel_check))
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { core })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    core: CoreHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(core);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<CoreState> {
    Json(state.core.snapshot().await)
}

async fn list_streams(
    State(state): State<HttpState>,
    Query(query): Query<StreamQuery>,
) -> Json<Vec<StreamRow>> {
    let snap = state.core.snapshot().await;
    let rows = filter_records(&snap.records, &query)
        .into_iter()
        .map(|(index, record)| StreamRow {
            index,
            status: snap.statuses.get(&index).copied(),
            record: record.clone(),
        })
        .collect();
    Json(rows)
}

async fn add_stream(
    State(state): State<HttpState>,
    Json(record): Json<StreamRecord>,
) -> ApiResult<(StatusCode, Json<Reply>)> {
    info!("HTTP API: Add stream {:?}", record.name);
    let reply = state.core.request(Command::Add { record }).await?;
    Ok((StatusCode::CREATED, Json(reply)))
}

async fn update_stream(
    State(state): State<HttpState>,
    Path(index): Path<usize>,
    Json(record): Json<StreamRecord>,
) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Update stream {}", index);
    Ok(Json(state.core.request(Command::Update { index, record }).await?))
}

async fn delete_stream(
    State(state): State<HttpState>,
    Path(index): Path<usize>,
) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Delete stream {}", index);
    Ok(Json(state.core.request(Command::Delete { index }).await?))
}

async fn load(
    State(state): State<HttpState>,
    body: Option<Json<LoadBody>>,
) -> ApiResult<Json<Reply>> {
    let Json(body) = body.unwrap_or_default();
    info!("HTTP API: Load {:?}", body.path);
    Ok(Json(state.core.request(Command::Load { path: body.path }).await?))
}

async fn save(
    State(state): State<HttpState>,
    body: Option<Json<SaveBody>>,
) -> ApiResult<Json<Reply>> {
    let Json(body) = body.unwrap_or_default();
    info!("HTTP API: Save {:?}", body.path);
    let cmd = Command::Save {
        path: body.path,
        overwrite: body.overwrite,
        backup: body.backup,
    };
    Ok(Json(state.core.request(cmd).await?))
}

async fn play(State(state): State<HttpState>, Path(index): Path<usize>) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Play stream {}", index);
    let cmd = Command::Play { index: Some(index) };
    Ok(Json(state.core.request(cmd).await?))
}

async fn stop(State(state): State<HttpState>) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Stop");
    Ok(Json(state.core.request(Command::Stop).await?))
}

async fn check(State(state): State<HttpState>, Path(index): Path<usize>) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Check stream {}", index);
    let cmd = Command::Check { index: Some(index) };
    Ok(Json(state.core.request(cmd).await?))
}

async fn check_all(State(state): State<HttpState>) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Check all");
    Ok(Json(state.core.request(Command::CheckAll).await?))
}

async fn cancel_check(State(state): State<HttpState>) -> ApiResult<Json<Reply>> {
    info!("HTTP API: Cancel check");
    Ok(Json(state.core.request(Command::CancelCheck).await?))
}

async fn events(State(state): State<HttpState>) -> impl IntoResponse {
    let mut rx = state.core.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok::<_, Infallible>(SseEvent::default().event(event_name(&event)).data(json));
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("HTTP API: event stream lagged, {} events dropped", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::StatusChanged { .. } => "status",
        Event::Progress { .. } => "progress",
        Event::CheckFinished { .. } => "check_finished",
        Event::PlaybackChanged { .. } => "playback",
        Event::RecordsChanged { .. } => "records",
        Event::Notice { .. } => "notice",
        Event::Log { .. } => "log",
    }
}
