//! JSON API over the engine's maps.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::MapError;
use crate::map::Map;
use crate::mapping::MapOptions;
use crate::scheduler::{ComponentHold, ComponentStatus, JobAction, StatusCounts};

#[derive(Clone)]
pub struct DashboardState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapSummary {
    pub tag: String,
    pub id: String,
    pub num_components: usize,
    pub transient: bool,
    pub counts: StatusCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapDetail {
    pub tag: String,
    pub id: String,
    pub status: String,
    pub is_done: bool,
    pub is_active: bool,
    pub counts: StatusCounts,
    pub components: Vec<ComponentStatus>,
    pub holds: BTreeMap<usize, ComponentHold>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitMapRequest {
    #[serde(default)]
    pub tag: Option<String>,
    pub command: String,
    /// One component per input, passed as `$1`
    #[serde(default)]
    pub inputs: Vec<String>,
    /// One component per argument list; takes precedence over `inputs`
    #[serde(default)]
    pub args: Vec<Vec<String>>,
    #[serde(default)]
    pub request_memory_mb: Option<u64>,
    #[serde(default)]
    pub request_disk_kb: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    #[serde(default)]
    force: bool,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    }))
}

/// A [`MapError`] rendered as a JSON error body.
pub struct ApiError(MapError);

impl From<MapError> for ApiError {
    fn from(e: MapError) -> Self {
        Self(e)
    }
}

pub fn status_code(e: &MapError) -> StatusCode {
    match e {
        MapError::TagNotFound(_) | MapError::MapWasRemoved(_) => StatusCode::NOT_FOUND,
        MapError::TagAlreadyExists(_) => StatusCode::CONFLICT,
        MapError::InvalidTag { .. }
        | MapError::EmptyMap
        | MapError::UnsupportedAction(_)
        | MapError::CannotRetagMap(_)
        | MapError::CannotRerunComponents(_)
        | MapError::ComponentOutOfRange { .. } => StatusCode::BAD_REQUEST,
        MapError::QueueFull | MapError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "API request failed");
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/maps", get(list_maps_handler).post(submit_map_handler))
        .route(
            "/api/maps/{tag}",
            get(map_detail_handler).delete(remove_map_handler),
        )
        .route("/api/maps/{tag}/{action}", post(map_action_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn summarize(map: &Map) -> Result<MapSummary, MapError> {
    let counts = map.status_counts().await?;
    Ok(MapSummary {
        tag: map.tag(),
        id: map.id().to_string(),
        num_components: counts.total(),
        transient: map.is_transient(),
        counts,
    })
}

async fn list_maps_handler(State(state): State<DashboardState>) -> ApiResult<Vec<MapSummary>> {
    let mut summaries = Vec::new();
    for map in state.engine.load_maps().await? {
        match summarize(&map).await {
            Ok(summary) => summaries.push(summary),
            // Removed between listing and summarizing
            Err(MapError::MapWasRemoved(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    ok(summaries)
}

async fn map_detail_handler(
    State(state): State<DashboardState>,
    Path(tag): Path<String>,
) -> ApiResult<MapDetail> {
    let map = state.engine.load(&tag).await?;
    let components = map.component_statuses().await?;
    ok(MapDetail {
        tag: map.tag(),
        id: map.id().to_string(),
        status: map.status().await?,
        is_done: components.iter().all(|s| *s == ComponentStatus::Completed),
        is_active: components.iter().any(|s| !s.is_finished()),
        counts: components.iter().copied().collect(),
        components,
        holds: map.holds().await?,
    })
}

async fn submit_map_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitMapRequest>,
) -> ApiResult<MapSummary> {
    let defaults = MapOptions::default();
    let options = MapOptions {
        request_memory_mb: payload.request_memory_mb.unwrap_or(defaults.request_memory_mb),
        request_disk_kb: payload.request_disk_kb.unwrap_or(defaults.request_disk_kb),
        ..defaults
    };
    let mapped = state.engine.mapped_with(payload.command, options);
    let tag = payload.tag.as_deref();

    let map = if payload.args.is_empty() {
        mapped.map(tag, payload.inputs).await?
    } else {
        mapped.starmap(tag, payload.args).await?
    };
    ok(summarize(&map).await?)
}

async fn map_action_handler(
    State(state): State<DashboardState>,
    Path((tag, action)): Path<(String, String)>,
) -> ApiResult<MapSummary> {
    let map = state.engine.load(&tag).await?;

    if action == "rerun" {
        map.rerun(None).await?;
        return ok(summarize(&map).await?);
    }

    let action: JobAction = action.parse().map_err(MapError::UnsupportedAction)?;
    match action {
        JobAction::Hold => map.hold().await?,
        JobAction::Release => map.release().await?,
        JobAction::Suspend => map.pause().await?,
        JobAction::Continue => map.resume().await?,
        JobAction::Vacate => map.vacate().await?,
        JobAction::Remove => {
            return Err(MapError::UnsupportedAction(
                "remove maps with DELETE /api/maps/{tag}".to_string(),
            )
            .into())
        }
    }
    ok(summarize(&map).await?)
}

async fn remove_map_handler(
    State(state): State<DashboardState>,
    Path(tag): Path<String>,
    Query(params): Query<RemoveParams>,
) -> ApiResult<String> {
    let map = state.engine.load(&tag).await?;
    map.remove(params.force).await?;
    ok(tag)
}
