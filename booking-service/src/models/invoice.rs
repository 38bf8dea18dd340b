use std::fmt;

use mongodb::bson::DateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PaymentChannel;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Consultation,
    FinalSettlement,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Consultation => "consultation",
            InvoiceType::FinalSettlement => "final_settlement",
        }
    }
}

/// Invoice lifecycle.
///
/// `pending -> paid | payment_overdue | cancelled`,
/// `payment_overdue -> paid | cancelled`, `paid -> refunded`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    PaymentOverdue,
    Refunded,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::PaymentOverdue => "payment_overdue",
            InvoiceStatus::Refunded => "refunded",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Refunded | InvoiceStatus::Cancelled
        )
    }

    /// States a payment may still land on.
    pub const PAYABLE: [InvoiceStatus; 2] = [InvoiceStatus::Pending, InvoiceStatus::PaymentOverdue];

    pub const ALL: [InvoiceStatus; 5] = [
        InvoiceStatus::Pending,
        InvoiceStatus::Paid,
        InvoiceStatus::PaymentOverdue,
        InvoiceStatus::Refunded,
        InvoiceStatus::Cancelled,
    ];
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: String,
    pub appointment_id: String,
    #[serde(rename = "type")]
    pub invoice_type: InvoiceType,
    pub amount: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    /// System-generated order reference sent to every gateway.
    pub reference_code: String,
    pub due_date: DateTime,
    #[serde(default)]
    pub hold_expires_at: Option<DateTime>,
    // Absent (not null) until paid so the partial unique index ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ref: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime>,
    #[serde(default)]
    pub paid_channel: Option<PaymentChannel>,
    #[serde(default)]
    pub refund_reason: Option<String>,
    #[serde(default)]
    pub refund_ref: Option<String>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub review_reason: Option<String>,
    #[serde(default = "default_synced")]
    pub synced: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

fn default_synced() -> bool {
    true
}

impl Invoice {
    pub fn new(
        appointment_id: &str,
        invoice_type: InvoiceType,
        amount: i64,
        currency: &str,
        due_date: DateTime,
        now: DateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            appointment_id: appointment_id.to_string(),
            invoice_type,
            amount,
            currency: currency.to_string(),
            status: InvoiceStatus::Pending,
            reference_code: generate_reference_code(),
            due_date,
            hold_expires_at: None,
            gateway_ref: None,
            paid_at: None,
            paid_channel: None,
            refund_reason: None,
            refund_ref: None,
            needs_review: false,
            review_reason: None,
            synced: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 12 decimal digits: fits PayOS's integer `orderCode`, VNPay's `vnp_TxnRef`
/// and a bank transfer memo alike.
pub fn generate_reference_code() -> String {
    rand::thread_rng()
        .gen_range(100_000_000_000u64..1_000_000_000_000u64)
        .to_string()
}

/// Field changes written by the invoice state machine. `None` leaves a field
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct InvoicePatch {
    pub status: Option<InvoiceStatus>,
    pub gateway_ref: Option<String>,
    pub hold_expires_at: Option<DateTime>,
    pub paid_at: Option<DateTime>,
    pub paid_channel: Option<PaymentChannel>,
    pub refund_reason: Option<String>,
    pub refund_ref: Option<String>,
    pub needs_review: Option<bool>,
    pub review_reason: Option<String>,
    pub synced: Option<bool>,
}

impl InvoicePatch {
    pub fn apply(&self, invoice: &mut Invoice, now: DateTime) {
        if let Some(status) = self.status {
            invoice.status = status;
        }
        if let Some(gateway_ref) = &self.gateway_ref {
            invoice.gateway_ref = Some(gateway_ref.clone());
        }
        if let Some(at) = self.hold_expires_at {
            invoice.hold_expires_at = Some(at);
        }
        if let Some(at) = self.paid_at {
            invoice.paid_at = Some(at);
        }
        if let Some(channel) = self.paid_channel {
            invoice.paid_channel = Some(channel);
        }
        if let Some(reason) = &self.refund_reason {
            invoice.refund_reason = Some(reason.clone());
        }
        if let Some(refund_ref) = &self.refund_ref {
            invoice.refund_ref = Some(refund_ref.clone());
        }
        if let Some(flag) = self.needs_review {
            invoice.needs_review = flag;
        }
        if let Some(reason) = &self.review_reason {
            invoice.review_reason = Some(reason.clone());
        }
        if let Some(synced) = self.synced {
            invoice.synced = synced;
        }
        invoice.updated_at = now;
    }
}
