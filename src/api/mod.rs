//! HTTP/REST surface (spec.md §6): zones, clients, media, health, and the
//! `/api/v1/cover/{id}` cover-art proxy.
//!
//! Grounded on the teacher's `api::AppState`/`Json<T>`/`StatusCode` handler
//! shape (plain `axum` extractors, no OpenAPI layer) — generalized from the
//! teacher's per-backend (Roon/HQPlayer/LMS/...) handler modules into one
//! handler set over [`crate::command::Router`] and [`crate::store::Stores`].
//! Every write goes through `Router::dispatch`, matching spec.md §4.4's
//! single-writer rule; handlers here never mutate a store directly.

use crate::bus::SharedBus;
use crate::command::{Command, Router, Source};
use crate::coordinator::AdapterCoordinator;
use crate::error::{ErrorKind, SnapDogError};
use crate::media::MediaCatalog;
use crate::model::{ClientIndex, PlaylistIndex, ZoneIndex};
use crate::store::Stores;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Everything a handler needs. Cheap to clone — every field is an `Arc` or a
/// `Copy` value, matching the teacher's `AppState` (one clone per request via
/// axum's `State` extractor, not per-handler construction).
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub bus: SharedBus,
    pub router: Arc<Router>,
    pub media: Arc<MediaCatalog>,
    pub coordinator: Arc<AdapterCoordinator>,
    pub api_keys: Arc<Vec<String>>,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------
// Response envelope (spec.md §6: `{success, data, error, requestId}`)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            request_id: request_id(),
        })
    }
}

/// Wraps [`SnapDogError`] so handlers can return `Result<Json<ApiResponse<T>>,
/// ApiError>` and `?`-propagate straight from [`Router::dispatch`] /
/// [`crate::store::Store`] lookups into the right HTTP status (spec.md §7).
pub struct ApiError(SnapDogError);

impl From<SnapDogError> for ApiError {
    fn from(err: SnapDogError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.0.code().to_string(),
                message: self.0.message,
            }),
            request_id: request_id(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ---------------------------------------------------------------------
// X-API-Key auth (spec.md §6: `ApiKey` scheme, 401 on missing/invalid)
// ---------------------------------------------------------------------

/// `axum::middleware::from_fn_with_state` layer. A no-op when
/// `state.api_keys` is empty, matching spec.md's "auth disabled accepts
/// everything" rule.
pub async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if state.api_keys.is_empty() {
        return next.run(request).await;
    }
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    match provided {
        Some(key) if state.api_keys.iter().any(|k| k == key) => next.run(request).await,
        _ => {
            let body: ApiResponse<()> = ApiResponse {
                success: false,
                data: None,
                error: Some(ApiErrorBody {
                    code: ErrorKind::Validation.code().to_string(),
                    message: "missing or invalid X-API-Key".to_string(),
                }),
                request_id: request_id(),
            };
            let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            response
                .headers_mut()
                .insert("WWW-Authenticate", "ApiKey".parse().unwrap());
            response
        }
    }
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Ready only once Snapcast has completed its initial reconciliation — the
/// only upstream every other surface depends on.
pub async fn readiness_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let global = state.stores.global.read().await;
    let status = if global.snapcast_connected { "ok" } else { "not_ready" };
    let code = if global.snapcast_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthBody {
            status,
            uptime_seconds: state.started_at.elapsed().as_secs(),
        }),
    )
}

pub async fn liveness_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        uptime_seconds: 0,
    })
}

// ---------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------

pub async fn list_zones_handler(State(state): State<AppState>) -> ApiResult<Vec<crate::model::Zone>> {
    let mut zones = state.stores.zones.get_all().await;
    zones.sort_by_key(|z| z.index);
    Ok(ApiResponse::ok(zones))
}

async fn get_zone(state: &AppState, idx: u16) -> Result<crate::model::Zone, ApiError> {
    state
        .stores
        .zones
        .get(&ZoneIndex(idx))
        .await
        .ok_or_else(|| SnapDogError::not_found(format!("zone {idx} not found")).into())
}

pub async fn get_zone_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<crate::model::Zone> {
    Ok(ApiResponse::ok(get_zone(&state, idx).await?))
}

#[derive(Serialize)]
pub struct PositionBody {
    position_ms: u64,
}

pub async fn zone_position_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<PositionBody> {
    let zone = get_zone(&state, idx).await?;
    Ok(ApiResponse::ok(PositionBody {
        position_ms: zone.position_ms,
    }))
}

#[derive(Serialize)]
pub struct ProgressBody {
    position_ms: u64,
    duration_ms: Option<u64>,
    percentage: Option<f64>,
}

pub async fn zone_progress_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<ProgressBody> {
    let zone = get_zone(&state, idx).await?;
    let percentage = zone
        .track_duration_ms
        .filter(|d| *d > 0)
        .map(|d| (zone.position_ms as f64 / d as f64 * 100.0).min(100.0));
    Ok(ApiResponse::ok(ProgressBody {
        position_ms: zone.position_ms,
        duration_ms: zone.track_duration_ms,
        percentage,
    }))
}

#[derive(Serialize)]
pub struct VolumeBody {
    volume: u8,
}

pub async fn zone_volume_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<VolumeBody> {
    let zone = get_zone(&state, idx).await?;
    Ok(ApiResponse::ok(VolumeBody { volume: zone.volume }))
}

#[derive(Serialize)]
pub struct MuteBody {
    muted: bool,
}

pub async fn zone_mute_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<MuteBody> {
    let zone = get_zone(&state, idx).await?;
    Ok(ApiResponse::ok(MuteBody { muted: zone.muted }))
}

#[derive(Serialize)]
pub struct PlaylistBody {
    playlist_index: Option<u16>,
}

pub async fn zone_playlist_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<PlaylistBody> {
    let zone = get_zone(&state, idx).await?;
    Ok(ApiResponse::ok(PlaylistBody {
        playlist_index: zone.playlist_index.map(|p| p.0),
    }))
}

async fn dispatch(state: &AppState, command: Command) -> Result<(), ApiError> {
    state.router.dispatch(command, Source::Api).await?;
    Ok(())
}

pub async fn zone_play_handler(State(state): State<AppState>, Path(idx): Path<u16>) -> ApiResult<()> {
    dispatch(&state, Command::ZonePlay { zone: ZoneIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_pause_handler(State(state): State<AppState>, Path(idx): Path<u16>) -> ApiResult<()> {
    dispatch(&state, Command::ZonePause { zone: ZoneIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_stop_handler(State(state): State<AppState>, Path(idx): Path<u16>) -> ApiResult<()> {
    dispatch(&state, Command::ZoneStop { zone: ZoneIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_next_handler(State(state): State<AppState>, Path(idx): Path<u16>) -> ApiResult<()> {
    dispatch(&state, Command::ZoneNext { zone: ZoneIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_previous_handler(State(state): State<AppState>, Path(idx): Path<u16>) -> ApiResult<()> {
    dispatch(&state, Command::ZonePrevious { zone: ZoneIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_set_volume_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(volume): Json<u8>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ZoneSetVolume { zone: ZoneIndex(idx), volume },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_set_playlist_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(playlist): Json<u16>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ZoneSetPlaylist { zone: ZoneIndex(idx), playlist },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_set_track_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(track_index): Json<u16>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ZoneSetTrack { zone: ZoneIndex(idx), track_index },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn zone_play_playlist_track_handler(
    State(state): State<AppState>,
    Path((idx, playlist)): Path<(u16, u16)>,
    Json(track_index): Json<u16>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ZonePlayTrackFromPlaylist {
            zone: ZoneIndex(idx),
            playlist,
            track_index,
        },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

// ---------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------

pub async fn list_clients_handler(
    State(state): State<AppState>,
) -> ApiResult<Vec<crate::model::Client>> {
    let mut clients = state.stores.clients.get_all().await;
    clients.sort_by_key(|c| c.index);
    Ok(ApiResponse::ok(clients))
}

async fn get_client(state: &AppState, idx: u16) -> Result<crate::model::Client, ApiError> {
    state
        .stores
        .clients
        .get(&ClientIndex(idx))
        .await
        .ok_or_else(|| SnapDogError::not_found(format!("client {idx} not found")).into())
}

pub async fn get_client_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<crate::model::Client> {
    Ok(ApiResponse::ok(get_client(&state, idx).await?))
}

pub async fn client_volume_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<VolumeBody> {
    let client = get_client(&state, idx).await?;
    Ok(ApiResponse::ok(VolumeBody { volume: client.volume }))
}

pub async fn client_mute_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<MuteBody> {
    let client = get_client(&state, idx).await?;
    Ok(ApiResponse::ok(MuteBody { muted: client.muted }))
}

pub async fn client_set_volume_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(volume): Json<u8>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ClientSetVolume { client: ClientIndex(idx), volume },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn client_set_latency_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(latency_ms): Json<i32>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ClientSetLatency { client: ClientIndex(idx), latency_ms },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn client_set_zone_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
    Json(zone): Json<u16>,
) -> ApiResult<()> {
    dispatch(
        &state,
        Command::ZoneAssignClient {
            zone: ZoneIndex(zone),
            client: ClientIndex(idx),
        },
    )
    .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn client_mute_toggle_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<()> {
    dispatch(&state, Command::ClientToggleMute { client: ClientIndex(idx) }).await?;
    Ok(ApiResponse::ok(()))
}

// ---------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------

pub async fn list_playlists_handler(State(state): State<AppState>) -> ApiResult<Vec<u16>> {
    let indices = state.media.list_playlists().await?;
    Ok(ApiResponse::ok(indices.into_iter().map(|p| p.0).collect()))
}

pub async fn get_playlist_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<crate::model::Playlist> {
    let playlist = state.media.get_playlist(PlaylistIndex(idx)).await?;
    Ok(ApiResponse::ok(playlist))
}

pub async fn playlist_tracks_handler(
    State(state): State<AppState>,
    Path(idx): Path<u16>,
) -> ApiResult<Vec<crate::model::Track>> {
    let playlist = state.media.get_playlist(PlaylistIndex(idx)).await?;
    Ok(ApiResponse::ok(playlist.tracks))
}

/// Proxies a cover-art id to the real Subsonic URL (with credentials) so the
/// credentials never reach the client, per spec.md §4.8.
pub async fn cover_art_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Redirect, ApiError> {
    state
        .media
        .cover_art_url(&id)
        .map(|url| Redirect::temporary(&url))
        .ok_or_else(|| SnapDogError::not_found("no Subsonic server configured").into())
}

// ---------------------------------------------------------------------
// System
// ---------------------------------------------------------------------

#[derive(Serialize)]
pub struct SystemStateBody {
    global: crate::model::GlobalState,
    adapters: std::collections::HashMap<String, crate::coordinator::AdapterStatus>,
}

pub async fn system_state_handler(State(state): State<AppState>) -> ApiResult<SystemStateBody> {
    let global = state.stores.global.read().await.clone();
    let adapters = state.coordinator.adapter_status().await;
    Ok(ApiResponse::ok(SystemStateBody { global, adapters }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_maps_not_found_to_404() {
        let err: ApiError = SnapDogError::not_found("zone 9 not found").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn api_error_maps_invalid_operation_to_409() {
        let err: ApiError = SnapDogError::invalid_operation("cannot seek a live stream").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
