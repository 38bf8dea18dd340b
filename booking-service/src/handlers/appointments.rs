use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{
    AppointmentResponse, BookingResponse, CancelAppointmentRequest, CompleteAppointmentRequest,
    CreateAppointmentRequest, RescheduleRequest,
};
use crate::models::Actor;
use crate::AppState;

pub async fn create_appointment(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    payload.validate()?;
    let booking = state
        .appointments
        .book(&actor, &payload.slot_id, DateTime::now())
        .await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state.appointments.get(&actor, &appointment_id).await?;
    Ok(Json(appointment.into()))
}

pub async fn approve(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = state
        .appointments
        .approve(&actor, &appointment_id, DateTime::now())
        .await?;
    Ok(Json(booking.into()))
}

pub async fn reject(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state
        .appointments
        .reject(&actor, &appointment_id, DateTime::now())
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn complete(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
    payload: Option<Json<CompleteAppointmentRequest>>,
) -> Result<Json<BookingResponse>, AppError> {
    let Json(payload) = payload.unwrap_or_default();
    payload.validate()?;
    let booking = state
        .appointments
        .complete(
            &actor,
            &appointment_id,
            payload.settlement_amount,
            DateTime::now(),
        )
        .await?;
    Ok(Json(booking.into()))
}

pub async fn cancel(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
    payload: Option<Json<CancelAppointmentRequest>>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let Json(payload) = payload.unwrap_or_default();
    payload.validate()?;
    let appointment = state
        .appointments
        .cancel(
            &actor,
            &appointment_id,
            payload.reason.as_deref(),
            DateTime::now(),
        )
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn request_reschedule(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
    Json(payload): Json<RescheduleRequest>,
) -> Result<Json<AppointmentResponse>, AppError> {
    payload.validate()?;
    let appointment = state
        .appointments
        .request_reschedule(&actor, &appointment_id, &payload.new_slot_id, DateTime::now())
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn accept_reschedule(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state
        .appointments
        .accept_reschedule(&actor, &appointment_id, DateTime::now())
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn reject_reschedule(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state
        .appointments
        .reject_reschedule(&actor, &appointment_id, DateTime::now())
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn self_accept_reschedule(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state
        .appointments
        .self_accept_reschedule(&actor, &appointment_id, DateTime::now())
        .await?;
    Ok(Json(appointment.into()))
}
