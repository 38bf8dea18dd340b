//! Gateway-facing endpoints plus the patient-facing payment helpers.
//!
//! Webhook and redirect routes are excluded from BFF request signing; they
//! are authenticated by the gateway's own signature inside the adapter.

use axum::{
    extract::{Path, RawQuery as RawQueryString, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{
    BankTransferRequest, InvoiceResponse, PaymentAckResponse, TransferInstructions,
    VnpayUrlRequest, VnpayUrlResponse,
};
use crate::error::PaymentError;
use crate::models::{Actor, Invoice, PaymentChannel, PaymentEvent};
use crate::services::metrics::record_payment_event;
use crate::services::pipeline::PipelineOutcome;
use crate::AppState;

/// What a gateway or the redirect page is told when a delivery fails. The
/// status is kept; the detail only goes to the logs.
fn gateway_error(err: PaymentError) -> AppError {
    let message = match &err {
        PaymentError::SignatureInvalid => "Invalid signature",
        PaymentError::MalformedPayload(_) => "Malformed payload",
        PaymentError::Forbidden(_) => "Not allowed to confirm this payment",
        _ => "Payment could not be processed",
    };
    let message = anyhow::anyhow!(message);
    match err {
        PaymentError::SignatureInvalid => AppError::Unauthorized(message),
        PaymentError::MalformedPayload(_) => AppError::BadRequest(message),
        PaymentError::Forbidden(_) => AppError::Forbidden(message),
        PaymentError::NotFound(_) => AppError::NotFound(message),
        PaymentError::AmountMismatch { .. } => AppError::Unprocessable(message),
        PaymentError::AlreadyTerminal { .. }
        | PaymentError::SlotConflict(_)
        | PaymentError::InvalidTransition(_)
        | PaymentError::Conflict(_) => AppError::Conflict(message),
        PaymentError::TransientStoreFailure(_) | PaymentError::RefundFailed(_) => {
            AppError::ServiceUnavailable(message)
        }
        PaymentError::Misconfigured(_) => AppError::ConfigError(message),
    }
}

async fn ingest(
    state: &AppState,
    channel: PaymentChannel,
    parsed: Result<PaymentEvent, PaymentError>,
) -> Result<PipelineOutcome, AppError> {
    let event = parsed.map_err(|e| {
        tracing::warn!(channel = channel.as_str(), error = %e, "Gateway payload refused");
        record_payment_event(channel.as_str(), e.kind());
        gateway_error(e)
    })?;

    let outcome = state
        .pipeline
        .process(&event, DateTime::now())
        .await
        .map_err(|e| {
            tracing::warn!(
                gateway_ref = %event.gateway_ref,
                channel = channel.as_str(),
                error = %e,
                "Payment processing failed"
            );
            gateway_error(e)
        })?;

    if let PipelineOutcome::Rejected { reason, .. } = &outcome {
        tracing::warn!(
            gateway_ref = %event.gateway_ref,
            channel = channel.as_str(),
            reason = %reason,
            "Payment rejected"
        );
    }
    tracing::info!(
        gateway_ref = %event.gateway_ref,
        reference_code = %event.reference_code,
        channel = channel.as_str(),
        outcome = outcome.as_str(),
        "Payment delivery handled"
    );
    Ok(outcome)
}

/// VNPay return forwarded by the frontend as the raw query string body.
pub async fn vnpay_return(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<PaymentAckResponse>, AppError> {
    let parsed = state.vnpay.parse(&body);
    let outcome = ingest(&state, PaymentChannel::VnpayReturn, parsed).await?;
    Ok(Json(PaymentAckResponse::from(&outcome)))
}

/// VNPay return hit directly by the browser redirect.
pub async fn vnpay_return_redirect(
    State(state): State<AppState>,
    RawQueryString(query): RawQueryString,
) -> Result<Json<PaymentAckResponse>, AppError> {
    let parsed = state.vnpay.parse(query.as_deref().unwrap_or_default());
    let outcome = ingest(&state, PaymentChannel::VnpayReturn, parsed).await?;
    Ok(Json(PaymentAckResponse::from(&outcome)))
}

/// PayOS webhook. Every processed delivery is acknowledged with 2xx so the
/// gateway stops retrying; only signature (401), parse (400) and transient
/// store (503) failures are not.
pub async fn payos_webhook(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<PaymentAckResponse>, AppError> {
    let parsed = state.payos.parse(&body);
    let outcome = ingest(&state, PaymentChannel::PayosWebhook, parsed).await?;
    Ok(Json(PaymentAckResponse::from(&outcome)))
}

pub async fn bank_transfer_confirm(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<BankTransferRequest>,
) -> Result<(StatusCode, Json<PaymentAckResponse>), AppError> {
    payload.validate()?;

    let parsed = state
        .bank_transfer
        .parse(&actor, &payload)
        .await
        .map(|(event, _)| event);
    let outcome = ingest(&state, PaymentChannel::BankTransferManual, parsed).await?;

    let status = match outcome {
        PipelineOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    Ok((status, Json(PaymentAckResponse::from(&outcome))))
}

async fn visible_invoice(
    state: &AppState,
    actor: &Actor,
    invoice_id: &str,
) -> Result<Invoice, AppError> {
    let invoice = state
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
    state
        .appointments
        .get(actor, &invoice.appointment_id)
        .await?;
    Ok(invoice)
}

pub async fn bank_transfer_instructions(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<String>,
) -> Result<Json<TransferInstructions>, AppError> {
    let invoice = visible_invoice(&state, &actor, &invoice_id).await?;
    Ok(Json(state.links.transfer_instructions(&invoice)?))
}

pub async fn vnpay_url(
    State(state): State<AppState>,
    actor: Actor,
    headers: HeaderMap,
    Json(payload): Json<VnpayUrlRequest>,
) -> Result<Json<VnpayUrlResponse>, AppError> {
    payload.validate()?;
    let invoice = visible_invoice(&state, &actor, &payload.invoice_id).await?;

    let client_ip = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("127.0.0.1");

    let payment_url = state.links.vnpay_url(&invoice, client_ip, DateTime::now())?;
    tracing::info!(invoice_id = %invoice.id, user_id = %actor.user_id, "VNPay payment URL issued");

    Ok(Json(VnpayUrlResponse {
        invoice_id: invoice.id,
        payment_url,
    }))
}

pub async fn payment_by_ref(
    State(state): State<AppState>,
    actor: Actor,
    Path(gateway_ref): Path<String>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state
        .store
        .find_invoice_by_gateway_ref(&gateway_ref)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No payment with that reference")))?;
    state
        .appointments
        .get(&actor, &invoice.appointment_id)
        .await?;
    Ok(Json(invoice.into()))
}
