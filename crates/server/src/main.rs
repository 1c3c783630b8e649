use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{DriverStats, ProfileSummary, TripId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatRoomResponse, CreateUserRequest, CreateUserResponse, FeedFrame, ReviewRequest,
        ReviewResponse, RouteRequest, RouteResponse,
    },
    trip::TripDocument,
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::ApiContext;
use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_LIST_LIMIT: u32 = 100;

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct TripListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        route_segments: settings.route_segments,
    };
    let (feed, _) = broadcast::channel(settings.feed_buffer);

    let app = build_router(Arc::new(AppState { api, feed }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/trips", get(http_list_trips).post(http_create_trip))
        .route("/trips/:trip_id", get(http_read_trip).put(http_write_trip))
        .route("/trips/:trip_id/feed", get(feed_handler))
        .route("/trips/:trip_id/reviews", post(http_submit_review))
        .route(
            "/trips/:trip_id/chat_room",
            get(http_chat_room).post(http_open_chat_room),
        )
        .route("/users", post(http_create_user))
        .route("/users/:user_id/profile", get(http_profile))
        .route("/drivers/:driver_id/stats", get(http_driver_stats))
        .route("/route", post(http_route))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn http_read_trip(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
) -> HttpResult<TripDocument> {
    api::read_trip(&state.api, trip_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_write_trip(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
    Json(document): Json<TripDocument>,
) -> HttpResult<TripDocument> {
    let stored = api::write_trip(&state.api, trip_id, document)
        .await
        .map_err(reject)?;
    info!(trip_id = %stored.trip_id, status = ?stored.status, "trip: stored");
    let _ = state.feed.send(stored.clone());
    Ok(Json(stored))
}

async fn http_create_trip(
    State(state): State<Arc<AppState>>,
    Json(document): Json<TripDocument>,
) -> Result<(StatusCode, Json<TripDocument>), (StatusCode, Json<ApiError>)> {
    let stored = api::create_trip(&state.api, document)
        .await
        .map_err(reject)?;
    info!(trip_id = %stored.trip_id, "trip: created");
    let _ = state.feed.send(stored.clone());
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn http_list_trips(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TripListQuery>,
) -> HttpResult<Vec<TripDocument>> {
    let limit = q.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let status = q.status.as_deref().unwrap_or("REQUESTED");
    api::list_trips(&state.api, status, limit)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> HttpResult<CreateUserResponse> {
    api::create_user(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_profile(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> HttpResult<ProfileSummary> {
    api::profile(&state.api, UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_driver_stats(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<i64>,
) -> HttpResult<DriverStats> {
    api::driver_stats(&state.api, UserId(driver_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_chat_room(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
) -> HttpResult<ChatRoomResponse> {
    api::chat_room(&state.api, trip_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_open_chat_room(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
) -> HttpResult<ChatRoomResponse> {
    api::open_chat_room(&state.api, trip_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_submit_review(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
    Json(req): Json<ReviewRequest>,
) -> HttpResult<ReviewResponse> {
    api::submit_review(&state.api, trip_id, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_route(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RouteRequest>,
) -> HttpResult<RouteResponse> {
    api::plan_route(&state.api, req).map(Json).map_err(reject)
}

async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<TripId>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| feed_connection(state, socket, trip_id))
}

/// Pushes the current value of one trip, then every later write to it.
async fn feed_connection(state: Arc<AppState>, socket: WebSocket, trip_id: TripId) {
    use futures::StreamExt;

    let (mut sender, mut receiver) = socket.split();
    // Subscribe before reading the seed so no write slips between the two.
    let mut feed_rx = state.feed.subscribe();

    let seed = current_frame(&state.api, trip_id).await;
    if send_frame(&mut sender, &seed).await.is_err() {
        return;
    }
    debug!(%trip_id, "feed: subscriber attached");

    let api = state.api.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = match feed_rx.recv().await {
                Ok(document) if document.trip_id == trip_id => FeedFrame::Snapshot { document },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%trip_id, skipped, "feed: subscriber lagged, resending current value");
                    current_frame(&api, trip_id).await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if send_frame(&mut sender, &frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(%trip_id, "feed: subscriber detached");
}

async fn current_frame(api: &ApiContext, trip_id: TripId) -> FeedFrame {
    match api::read_trip(api, trip_id).await {
        Ok(document) => FeedFrame::Snapshot { document },
        Err(err) if err.code == ErrorCode::NotFound => FeedFrame::Absent { trip_id },
        Err(err) => FeedFrame::Error(err),
    }
}

async fn send_frame<S>(sender: &mut S, frame: &FeedFrame) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    use futures::SinkExt;

    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
