use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{
    rfc3339, Appointment, AppointmentStatus, Invoice, InvoiceStatus, InvoiceType, PaymentChannel,
    ScheduleSlot,
};
use crate::services::appointments::Booking;
use crate::services::pipeline::PipelineOutcome;

pub use crate::adapters::BankTransferRequest;
pub use crate::services::payment_links::TransferInstructions;
pub use crate::services::sweeper::SweepReport;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSlotRequest {
    /// Required when an admin publishes on a doctor's behalf.
    #[validate(length(min = 1, max = 64))]
    pub doctor_id: Option<String>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAppointmentRequest {
    #[validate(length(min = 1, max = 64))]
    pub slot_id: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CompleteAppointmentRequest {
    #[validate(range(min = 1))]
    pub settlement_amount: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelAppointmentRequest {
    #[validate(length(min = 1, max = 200))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RescheduleRequest {
    #[validate(length(min = 1, max = 64))]
    pub new_slot_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundInvoiceRequest {
    #[validate(length(min = 1, max = 200))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VnpayUrlRequest {
    #[validate(length(min = 1, max = 64))]
    pub invoice_id: String,
}

#[derive(Debug, Serialize)]
pub struct VnpayUrlResponse {
    pub invoice_id: String,
    pub payment_url: String,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: String,
    pub appointment_id: String,
    #[serde(rename = "type")]
    pub invoice_type: InvoiceType,
    pub amount: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub reference_code: String,
    pub due_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_channel: Option<PaymentChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_ref: Option<String>,
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            id: invoice.id,
            appointment_id: invoice.appointment_id,
            invoice_type: invoice.invoice_type,
            amount: invoice.amount,
            currency: invoice.currency,
            status: invoice.status,
            reference_code: invoice.reference_code,
            due_date: rfc3339(invoice.due_date),
            hold_expires_at: invoice.hold_expires_at.map(rfc3339),
            gateway_ref: invoice.gateway_ref,
            paid_at: invoice.paid_at.map(rfc3339),
            paid_channel: invoice.paid_channel,
            refund_reason: invoice.refund_reason,
            refund_ref: invoice.refund_ref,
            needs_review: invoice.needs_review,
            review_reason: invoice.review_reason,
            created_at: rfc3339(invoice.created_at),
            updated_at: rfc3339(invoice.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AppointmentResponse {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub schedule_id: String,
    pub status: AppointmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reschedule_requested_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Appointment> for AppointmentResponse {
    fn from(appointment: Appointment) -> Self {
        Self {
            id: appointment.id,
            patient_id: appointment.patient_id,
            doctor_id: appointment.doctor_id,
            schedule_id: appointment.schedule_id,
            status: appointment.status,
            proposed_schedule_id: appointment.proposed_schedule_id,
            reschedule_requested_at: appointment.reschedule_requested_at.map(rfc3339),
            cancel_reason: appointment.cancel_reason,
            created_at: rfc3339(appointment.created_at),
            updated_at: rfc3339(appointment.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub appointment: AppointmentResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<InvoiceResponse>,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        Self {
            appointment: booking.appointment.into(),
            invoice: booking.invoice.map(Into::into),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SlotResponse {
    pub id: String,
    pub doctor_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_booked: bool,
}

impl From<ScheduleSlot> for SlotResponse {
    fn from(slot: ScheduleSlot) -> Self {
        Self {
            id: slot.id,
            doctor_id: slot.doctor_id,
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            is_booked: slot.is_booked,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AppointmentRef {
    pub id: String,
}

/// Acknowledgment returned to gateways and to the redirect page.
#[derive(Debug, Serialize)]
pub struct PaymentAckResponse {
    pub success: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment: Option<AppointmentRef>,
}

impl From<&PipelineOutcome> for PaymentAckResponse {
    fn from(outcome: &PipelineOutcome) -> Self {
        let message = match outcome {
            PipelineOutcome::Applied { .. } => None,
            PipelineOutcome::Duplicate { .. } => Some("Payment already processed".to_string()),
            PipelineOutcome::Rejected { .. } => Some("Payment rejected".to_string()),
            PipelineOutcome::Declined { .. } => Some("Payment was not completed".to_string()),
        };
        Self {
            success: outcome.is_success(),
            outcome: outcome.as_str(),
            message,
            appointment: outcome.invoice().map(|invoice| AppointmentRef {
                id: invoice.appointment_id.clone(),
            }),
        }
    }
}
