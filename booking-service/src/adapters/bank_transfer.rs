use std::sync::Arc;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::PaymentError;
use crate::models::{Actor, Invoice, PaymentChannel, PaymentEvent, Role};
use crate::services::store::Store;

/// A patient's claim that they paid an invoice by bank transfer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BankTransferRequest {
    #[validate(length(equal = 12))]
    pub reference_code: String,
    /// Transferred amount; the invoice amount when omitted.
    #[validate(range(min = 1))]
    pub amount: Option<i64>,
    #[validate(length(min = 1, max = 64))]
    pub bank_transaction_id: Option<String>,
}

/// Manual transfers carry no gateway signature. Trust comes from the
/// BFF-authenticated patient, who may only confirm their own invoices.
#[derive(Clone)]
pub struct BankTransferAdapter {
    store: Arc<dyn Store>,
}

impl BankTransferAdapter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn parse(
        &self,
        actor: &Actor,
        request: &BankTransferRequest,
    ) -> Result<(PaymentEvent, Invoice), PaymentError> {
        if actor.role != Role::Patient {
            return Err(PaymentError::Forbidden(
                "only patients confirm bank transfers".to_string(),
            ));
        }

        // Unknown and foreign references look the same to the caller.
        let not_yours = || {
            PaymentError::Forbidden("reference does not belong to this patient".to_string())
        };
        let invoice = self
            .store
            .find_invoice_by_reference(&request.reference_code)
            .await?
            .ok_or_else(not_yours)?;
        let appointment = self.store.get_appointment(&invoice.appointment_id).await?;
        if appointment.map(|a| a.patient_id) != Some(actor.user_id.clone()) {
            tracing::warn!(
                user_id = %actor.user_id,
                reference_code = %request.reference_code,
                "Bank transfer confirmation for another patient's invoice"
            );
            return Err(not_yours());
        }

        let bank_ref = request
            .bank_transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&request.reference_code);

        let event = PaymentEvent {
            channel: PaymentChannel::BankTransferManual,
            gateway_ref: format!("bank:{}", bank_ref),
            reference_code: request.reference_code.clone(),
            amount: request.amount.unwrap_or(invoice.amount),
            succeeded: true,
            raw_payload: serde_json::to_string(request).unwrap_or_default(),
            claimed_signature: None,
        };
        Ok((event, invoice))
    }
}
