use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::models::{AlertSubmission, AppendResponse, CurrentTemperatureResponse};
use crate::rate_limit::Quota;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use telemetry::pipeline::ReadingSubmission;
use tracing::info;
use types::ids::DeviceId;

/// Append a reading to the ledger. Observers see it after the next pass.
pub async fn submit_reading(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ReadingSubmission>,
) -> Result<(StatusCode, Json<AppendResponse>), AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::WRITES)?;
    user.require_device(&state, &payload.device_id)?;

    if !payload.temperature.is_finite() {
        return Err(AppError::BadRequest("temperature must be a finite number".into()));
    }

    let device_id = payload.device_id.clone();
    let document = state.pipeline.submit_reading(payload).await?;
    info!(
        device_id = %device_id,
        user_id = %user.grant.user_id,
        id = %document.id,
        "Reading submitted"
    );

    Ok((StatusCode::CREATED, Json(document.into())))
}

pub async fn current(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<CurrentTemperatureResponse>, AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::READS)?;

    let policy = state.registry.policy();
    let visible = |device_id: &DeviceId| {
        user.grant
            .access_level
            .satisfies(policy.required_for(device_id))
    };

    let readings = state
        .pipeline
        .current_states()
        .await?
        .into_values()
        .filter(|reading| visible(&reading.device_id))
        .collect();
    let active_alerts = state
        .pipeline
        .active_alerts()
        .await?
        .into_values()
        .filter(|alert| visible(&alert.device_id))
        .collect();

    Ok(Json(CurrentTemperatureResponse {
        readings,
        active_alerts,
        limit: state.pipeline.policy().limit,
    }))
}

/// Append a manually raised alert record.
pub async fn submit_alert(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<AlertSubmission>,
) -> Result<(StatusCode, Json<AppendResponse>), AppError> {
    state.rate_limiter.check(&user.grant.user_id, Quota::WRITES)?;
    user.require_device(&state, &payload.device_id)?;

    if !payload.current_value.is_finite() {
        return Err(AppError::BadRequest("currentValue must be a finite number".into()));
    }

    let policy = state.pipeline.policy();
    let severity = policy.severity_for(payload.current_value);
    let record = payload.into_record(policy.limit, severity);
    let document = state.pipeline.submit_alert(&record).await?;
    info!(
        device_id = %record.device_id,
        severity = %record.severity,
        user_id = %user.grant.user_id,
        "Alert submitted"
    );

    Ok((StatusCode::CREATED, Json(document.into())))
}
