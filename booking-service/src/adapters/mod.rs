//! Gateway adapters: turn one channel's raw notification into a trusted
//! `PaymentEvent`, or refuse it.

pub mod bank_transfer;
pub mod payos_webhook;
pub mod query;
pub mod vnpay_return;

pub use bank_transfer::{BankTransferAdapter, BankTransferRequest};
pub use payos_webhook::PayosWebhookAdapter;
pub use query::RawQuery;
pub use vnpay_return::VnpayReturnAdapter;

use crate::error::PaymentError;
use crate::services::signature::SignatureError;

/// Gateway signature failures all reject the payload. A missing secret is
/// logged by the verifier as a configuration error and fails closed.
pub(crate) fn signature_rejection(err: SignatureError) -> PaymentError {
    match err {
        SignatureError::Digest(e) => PaymentError::Misconfigured(e.to_string()),
        SignatureError::MissingSecret
        | SignatureError::MissingSignature
        | SignatureError::Mismatch => PaymentError::SignatureInvalid,
    }
}
