use axum::{
    extract::{Path, State},
    Json,
};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{InvoiceResponse, RefundInvoiceRequest};
use crate::models::Actor;
use crate::AppState;

pub async fn get_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<String>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state
        .store
        .get_invoice(&invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
    state
        .appointments
        .get(&actor, &invoice.appointment_id)
        .await?;
    Ok(Json(invoice.into()))
}

pub async fn list_for_appointment(
    State(state): State<AppState>,
    actor: Actor,
    Path(appointment_id): Path<String>,
) -> Result<Json<Vec<InvoiceResponse>>, AppError> {
    state.appointments.get(&actor, &appointment_id).await?;
    let invoices = state
        .store
        .list_invoices_for_appointment(&appointment_id)
        .await?;
    Ok(Json(invoices.into_iter().map(Into::into).collect()))
}

/// Admin refund of a paid invoice. The appointment follows through the
/// synchronizer (a refunded consultation cancels it).
pub async fn refund_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<String>,
    Json(payload): Json<RefundInvoiceRequest>,
) -> Result<Json<InvoiceResponse>, AppError> {
    if !actor.is_admin() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Only admins can refund invoices"
        )));
    }
    payload.validate()?;

    let now = DateTime::now();
    let refunded = state
        .invoices
        .refund(&invoice_id, &payload.reason, state.refunds.as_ref(), now)
        .await?;
    tracing::info!(
        invoice_id = %refunded.id,
        admin_id = %actor.user_id,
        reason = %payload.reason,
        "Invoice refunded by admin"
    );

    if let Err(e) = state
        .synchronizer
        .sync_invoice_with_retry(&refunded.id, now)
        .await
    {
        tracing::error!(invoice_id = %refunded.id, error = %e, "Post-refund sync deferred");
    }

    let current = state.store.get_invoice(&refunded.id).await?.unwrap_or(refunded);
    Ok(Json(current.into()))
}
