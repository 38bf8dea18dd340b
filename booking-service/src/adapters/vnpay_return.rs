use secrecy::Secret;

use super::{signature_rejection, RawQuery};
use crate::error::PaymentError;
use crate::models::{PaymentChannel, PaymentEvent};
use crate::services::signature::{HashAlgorithm, SignatureVerifier};

const SUCCESS: &str = "00";

/// VNPay redirect confirmation, forwarded by the patient's browser as the
/// raw return query string.
#[derive(Clone)]
pub struct VnpayReturnAdapter {
    verifier: SignatureVerifier,
}

impl VnpayReturnAdapter {
    pub fn new(hash_secret: Option<Secret<String>>) -> Self {
        Self {
            verifier: SignatureVerifier::new(HashAlgorithm::Sha512, hash_secret),
        }
    }

    pub fn parse(&self, raw_query: &str) -> Result<PaymentEvent, PaymentError> {
        let query = RawQuery::parse(raw_query);
        if query.is_empty() {
            return Err(PaymentError::MalformedPayload(
                "empty return query".to_string(),
            ));
        }

        let form = self
            .verifier
            .verify_query(query.pairs(), query.get("vnp_SecureHash"))
            .map_err(signature_rejection)?;
        tracing::debug!(canonicalization = form.as_str(), "VNPay return verified");

        let reference_code = required(&query, "vnp_TxnRef")?;
        // VNPay sends the amount in hundredths of a dong.
        let minor = required(&query, "vnp_Amount")?
            .parse::<i64>()
            .map_err(|_| PaymentError::MalformedPayload("vnp_Amount is not an integer".to_string()))?;
        if minor % 100 != 0 {
            return Err(PaymentError::MalformedPayload(
                "vnp_Amount is not a whole number of dong".to_string(),
            ));
        }
        let amount = minor / 100;

        let succeeded = query.get("vnp_ResponseCode") == Some(SUCCESS)
            && query
                .get("vnp_TransactionStatus")
                .map_or(true, |status| status == SUCCESS);

        // Failed payments carry no (or a zero) transaction number.
        let gateway_ref = match query.decoded("vnp_TransactionNo") {
            Some(no) if !no.is_empty() && no != "0" => no,
            _ if succeeded => {
                return Err(PaymentError::MalformedPayload(
                    "vnp_TransactionNo missing".to_string(),
                ))
            }
            _ => format!("declined:{}", reference_code),
        };

        Ok(PaymentEvent {
            channel: PaymentChannel::VnpayReturn,
            gateway_ref,
            reference_code,
            amount,
            succeeded,
            raw_payload: raw_query.to_string(),
            claimed_signature: query.get("vnp_SecureHash").map(str::to_string),
        })
    }
}

fn required(query: &RawQuery, key: &str) -> Result<String, PaymentError> {
    query
        .decoded(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::MalformedPayload(format!("{} missing", key)))
}
