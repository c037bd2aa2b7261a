use crate::core::{SessionEvent, SharedSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tuner_proto::protocol::Command;
use tuner_proto::session::SessionSnapshot;
use tuner_proto::station::{SegmentDraft, Station, StationDraft, StationId, StationPatch};
use tuner_proto::store::{StationStore, StoreError};

#[derive(Clone)]
struct HttpState {
    snapshot: SharedSnapshot,
    store: Arc<StationStore>,
    event_tx: mpsc::Sender<SessionEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    snapshot: SharedSnapshot,
    store: Arc<StationStore>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            snapshot,
            store,
            event_tx,
        });

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

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play", post(resume))
        .route("/api/play/:id", post(play_station))
        .route("/api/pause", post(pause))
        .route("/api/stop", post(stop))
        .route("/api/next", post(next_station))
        .route("/api/previous", post(previous_station))
        .route("/api/volume/:value", post(set_volume))
        .route("/api/mute", post(toggle_mute))
        .route("/api/stations", get(list_stations).post(create_station))
        .route("/api/stations/all", get(list_all_stations))
        .route(
            "/api/stations/:id",
            get(get_station).put(update_station).delete(delete_station),
        )
        .route("/api/stations/:id/programming", post(add_segment))
        .route(
            "/api/stations/:id/programming/:segment_id",
            delete(remove_segment),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── error mapping ─────────────────────────────────────────────────────────────

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) | StoreError::Json(_) => {
                error!("HTTP API: store failure: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── playback ──────────────────────────────────────────────────────────────────

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
        error!("HTTP API: session loop is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.snapshot.read().await.clone())
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Play { station_id: None }).await
}

async fn play_station(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    let cmd = Command::Play {
        station_id: Some(StationId::new(id)),
    };
    send_command(&state, cmd).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Pause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Stop).await
}

async fn next_station(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Next).await
}

async fn previous_station(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Previous).await
}

async fn set_volume(State(state): State<HttpState>, Path(value): Path<i32>) -> StatusCode {
    send_command(&state, Command::SetVolume { value }).await
}

async fn toggle_mute(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::ToggleMute).await
}

// ── station admin ─────────────────────────────────────────────────────────────

/// Let the session pick up a store edit without touching playback.
async fn catalog_changed(state: &HttpState) {
    if state.event_tx.send(SessionEvent::ReloadCatalog).await.is_err() {
        error!("HTTP API: session loop is gone, catalog not reloaded");
    }
}

async fn list_stations(State(state): State<HttpState>) -> ApiResult<Json<Vec<Station>>> {
    Ok(Json(state.store.list_active().await?))
}

async fn list_all_stations(State(state): State<HttpState>) -> ApiResult<Json<Vec<Station>>> {
    Ok(Json(state.store.list_all().await?))
}

async fn get_station(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Station>> {
    let id = StationId::new(id);
    match state.store.get(&id).await? {
        Some(station) => Ok(Json(station)),
        None => Err(StoreError::NotFound(id).into()),
    }
}

async fn create_station(
    State(state): State<HttpState>,
    Json(draft): Json<StationDraft>,
) -> ApiResult<(StatusCode, Json<Station>)> {
    let station = state.store.create(draft).await?;
    info!("HTTP API: created station {} '{}'", station.id, station.name);
    catalog_changed(&state).await;
    Ok((StatusCode::CREATED, Json(station)))
}

async fn update_station(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(patch): Json<StationPatch>,
) -> ApiResult<Json<Station>> {
    let station = state.store.update(&StationId::new(id), patch).await?;
    info!("HTTP API: updated station {}", station.id);
    catalog_changed(&state).await;
    Ok(Json(station))
}

async fn delete_station(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Station>> {
    let station = state.store.deactivate(&StationId::new(id)).await?;
    info!("HTTP API: deactivated station {}", station.id);
    catalog_changed(&state).await;
    Ok(Json(station))
}

async fn add_segment(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(segment): Json<SegmentDraft>,
) -> ApiResult<Json<Station>> {
    let station = state.store.add_segment(&StationId::new(id), segment).await?;
    catalog_changed(&state).await;
    Ok(Json(station))
}

async fn remove_segment(
    State(state): State<HttpState>,
    Path((id, segment_id)): Path<(String, String)>,
) -> ApiResult<Json<Station>> {
    let station = state
        .store
        .remove_segment(&StationId::new(id), &segment_id)
        .await?;
    catalog_changed(&state).await;
    Ok(Json(station))
}
