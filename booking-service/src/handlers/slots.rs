use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{CreateSlotRequest, SlotResponse};
use crate::models::Actor;
use crate::AppState;

pub async fn create_slot(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateSlotRequest>,
) -> Result<(StatusCode, Json<SlotResponse>), AppError> {
    payload.validate()?;
    let slot = state
        .appointments
        .create_slot(
            &actor,
            payload.doctor_id.as_deref(),
            payload.date,
            payload.start_time,
            payload.end_time,
            DateTime::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(slot.into())))
}

pub async fn get_slot(
    State(state): State<AppState>,
    _actor: Actor,
    Path(slot_id): Path<String>,
) -> Result<Json<SlotResponse>, AppError> {
    let slot = state.appointments.get_slot(&slot_id).await?;
    Ok(Json(slot.into()))
}
