use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::models::{DeviceStatus, DevicesResponse, HistoryQuery, HistoryResponse};
use crate::rate_limit::Quota;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use types::ids::DeviceId;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

fn parse_device_id(raw: String) -> Result<DeviceId, AppError> {
    DeviceId::try_new(raw).ok_or_else(|| AppError::BadRequest("device id must not be empty".into()))
}

/// Current state of every device the caller may monitor.
pub async fn list_devices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<DevicesResponse>, AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::READS)?;

    let readings = state.pipeline.current_states().await?;
    let mut alerts = state.pipeline.active_alerts().await?;
    let policy = state.registry.policy();

    let devices: Vec<DeviceStatus> = readings
        .into_values()
        .filter(|reading| {
            user.grant
                .access_level
                .satisfies(policy.required_for(&reading.device_id))
        })
        .map(|reading| DeviceStatus {
            active_alert: alerts.remove(&reading.device_id),
            reading,
        })
        .collect();

    Ok(Json(DevicesResponse {
        count: devices.len(),
        devices,
    }))
}

pub async fn get_device(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStatus>, AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::READS)?;
    let device_id = parse_device_id(device_id)?;
    user.require_device(&state, &device_id)?;

    let mut readings = state.pipeline.current_states().await?;
    let reading = readings
        .remove(&device_id)
        .ok_or_else(|| AppError::NotFound(format!("no readings for device {device_id}")))?;
    let active_alert = state.pipeline.active_alerts().await?.remove(&device_id);

    Ok(Json(DeviceStatus {
        reading,
        active_alert,
    }))
}

/// Readings of one device, newest first.
pub async fn device_history(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::READS)?;
    let device_id = parse_device_id(device_id)?;
    user.require_device(&state, &device_id)?;

    let limit = match query.limit {
        Some(0) => return Err(AppError::BadRequest("limit must be positive".into())),
        Some(limit) => limit.min(MAX_HISTORY_LIMIT),
        None => DEFAULT_HISTORY_LIMIT,
    };

    let readings = state
        .pipeline
        .device_history(&device_id, Some(limit))
        .await?;

    Ok(Json(HistoryResponse {
        device_id,
        readings,
    }))
}
