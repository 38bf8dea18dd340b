//! Payment and booking error taxonomy.
//!
//! Gateway-facing handlers map these onto acknowledgments; everything else
//! converts into `AppError` for the HTTP surface.

use service_core::error::AppError;
use thiserror::Error;

use crate::models::InvoiceStatus;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: i64, received: i64 },

    #[error("invoice {invoice_id} is already {status}")]
    AlreadyTerminal {
        invoice_id: String,
        status: InvoiceStatus,
    },

    #[error("slot {0} is not available")]
    SlotConflict(String),

    #[error("transient store failure: {0}")]
    TransientStoreFailure(anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("refund failed: {0}")]
    RefundFailed(String),
}

impl PaymentError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::TransientStoreFailure(_))
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::SignatureInvalid => "signature_invalid",
            PaymentError::AmountMismatch { .. } => "amount_mismatch",
            PaymentError::AlreadyTerminal { .. } => "already_terminal",
            PaymentError::SlotConflict(_) => "slot_conflict",
            PaymentError::TransientStoreFailure(_) => "transient_store_failure",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::InvalidTransition(_) => "invalid_transition",
            PaymentError::Conflict(_) => "conflict",
            PaymentError::Forbidden(_) => "forbidden",
            PaymentError::Misconfigured(_) => "misconfigured",
            PaymentError::MalformedPayload(_) => "malformed_payload",
            PaymentError::RefundFailed(_) => "refund_failed",
        }
    }
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => PaymentError::Conflict(what),
            StoreError::Backend(e) => PaymentError::TransientStoreFailure(e),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let message = err.to_string();
        match err {
            PaymentError::SignatureInvalid => AppError::Unauthorized(anyhow::anyhow!(message)),
            PaymentError::AmountMismatch { .. } => {
                AppError::Unprocessable(anyhow::anyhow!(message))
            }
            PaymentError::AlreadyTerminal { .. } => AppError::Conflict(anyhow::anyhow!(message)),
            PaymentError::SlotConflict(_) => AppError::Conflict(anyhow::anyhow!(message)),
            PaymentError::TransientStoreFailure(e) => AppError::ServiceUnavailable(e),
            PaymentError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(message)),
            PaymentError::InvalidTransition(_) => AppError::Conflict(anyhow::anyhow!(message)),
            PaymentError::Conflict(_) => AppError::Conflict(anyhow::anyhow!(message)),
            PaymentError::Forbidden(_) => AppError::Forbidden(anyhow::anyhow!(message)),
            PaymentError::Misconfigured(_) => AppError::ConfigError(anyhow::anyhow!(message)),
            PaymentError::MalformedPayload(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            PaymentError::RefundFailed(_) => {
                AppError::ServiceUnavailable(anyhow::anyhow!(message))
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        PaymentError::from(err).into()
    }
}
