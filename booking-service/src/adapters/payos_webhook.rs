use secrecy::Secret;
use serde_json::Value;

use super::signature_rejection;
use crate::error::PaymentError;
use crate::models::{PaymentChannel, PaymentEvent};
use crate::services::signature::{HashAlgorithm, SignatureVerifier};

/// PayOS webhook: `{code, desc, success, data: {...}, signature}` where the
/// signature covers `data`.
#[derive(Clone)]
pub struct PayosWebhookAdapter {
    verifier: SignatureVerifier,
}

impl PayosWebhookAdapter {
    pub fn new(checksum_key: Option<Secret<String>>) -> Self {
        Self {
            verifier: SignatureVerifier::new(HashAlgorithm::Sha256, checksum_key),
        }
    }

    /// `raw_body` must be the exact bytes received; the candidate forms are
    /// cut from it.
    pub fn parse(&self, raw_body: &str) -> Result<PaymentEvent, PaymentError> {
        let envelope: Value = serde_json::from_str(raw_body)
            .map_err(|e| PaymentError::MalformedPayload(format!("webhook body: {}", e)))?;
        let Value::Object(envelope) = envelope else {
            return Err(PaymentError::MalformedPayload(
                "webhook body is not an object".to_string(),
            ));
        };

        let signature = envelope.get("signature").and_then(text);
        let form = self
            .verifier
            .verify_json_payload(raw_body, signature.as_deref())
            .map_err(signature_rejection)?;
        tracing::debug!(canonicalization = form.as_str(), "PayOS webhook verified");

        let data = envelope
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| PaymentError::MalformedPayload("data missing".to_string()))?;

        let reference_code = data
            .get("orderCode")
            .and_then(text)
            .ok_or_else(|| PaymentError::MalformedPayload("data.orderCode missing".to_string()))?;
        let amount = data
            .get("amount")
            .and_then(integer)
            .ok_or_else(|| PaymentError::MalformedPayload("data.amount missing".to_string()))?;
        let gateway_ref = ["reference", "paymentLinkId"]
            .iter()
            .find_map(|key| data.get(*key).and_then(text).filter(|v| !v.is_empty()))
            .ok_or_else(|| PaymentError::MalformedPayload("data.reference missing".to_string()))?;

        let code = envelope.get("code").and_then(text);
        let succeeded = code.as_deref() == Some("00")
            && envelope.get("success").and_then(Value::as_bool) != Some(false);

        Ok(PaymentEvent {
            channel: PaymentChannel::PayosWebhook,
            gateway_ref,
            reference_code,
            amount,
            succeeded,
            raw_payload: raw_body.to_string(),
            claimed_signature: signature,
        })
    }
}

/// Strings as-is, numbers rendered; PayOS sends `orderCode` as a number.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
