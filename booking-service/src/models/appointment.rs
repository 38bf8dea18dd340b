use std::fmt;

use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Awaiting doctor approval; slot held, nothing billed yet.
    Requested,
    PendingPayment,
    Confirmed,
    PaymentOverdue,
    RescheduleRequested,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Requested => "requested",
            AppointmentStatus::PendingPayment => "pending_payment",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::PaymentOverdue => "payment_overdue",
            AppointmentStatus::RescheduleRequested => "reschedule_requested",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Every state from which an appointment may still be cancelled.
    pub const CANCELLABLE: [AppointmentStatus; 5] = [
        AppointmentStatus::Requested,
        AppointmentStatus::PendingPayment,
        AppointmentStatus::Confirmed,
        AppointmentStatus::PaymentOverdue,
        AppointmentStatus::RescheduleRequested,
    ];
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Appointment {
    #[serde(rename = "_id")]
    pub id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub schedule_id: String,
    pub status: AppointmentStatus,
    /// Slot tentatively reserved by a pending reschedule.
    #[serde(default)]
    pub proposed_schedule_id: Option<String>,
    #[serde(default)]
    pub reschedule_requested_at: Option<DateTime>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Appointment {
    pub fn new(
        patient_id: &str,
        doctor_id: &str,
        schedule_id: &str,
        status: AppointmentStatus,
        now: DateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            schedule_id: schedule_id.to_string(),
            status,
            proposed_schedule_id: None,
            reschedule_requested_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.patient_id == user_id || self.doctor_id == user_id
    }

    /// Whether this appointment still has a claim on `slot_id`: its own slot
    /// unless cancelled, or a pending reschedule target.
    pub fn claims_slot(&self, slot_id: &str) -> bool {
        if self.status == AppointmentStatus::Cancelled {
            return false;
        }
        self.schedule_id == slot_id || self.proposed_schedule_id.as_deref() == Some(slot_id)
    }
}

/// Field changes for an appointment. For the nullable reschedule fields,
/// `Some(None)` clears the value.
#[derive(Debug, Default, Clone)]
pub struct AppointmentPatch {
    pub status: Option<AppointmentStatus>,
    pub schedule_id: Option<String>,
    pub proposed_schedule_id: Option<Option<String>>,
    pub reschedule_requested_at: Option<Option<DateTime>>,
    pub cancel_reason: Option<String>,
}

impl AppointmentPatch {
    pub fn status(status: AppointmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn cancelled(reason: &str) -> Self {
        Self {
            status: Some(AppointmentStatus::Cancelled),
            cancel_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn apply(&self, appointment: &mut Appointment, now: DateTime) {
        if let Some(status) = self.status {
            appointment.status = status;
        }
        if let Some(schedule_id) = &self.schedule_id {
            appointment.schedule_id = schedule_id.clone();
        }
        if let Some(proposed) = &self.proposed_schedule_id {
            appointment.proposed_schedule_id = proposed.clone();
        }
        if let Some(at) = self.reschedule_requested_at {
            appointment.reschedule_requested_at = at;
        }
        if let Some(reason) = &self.cancel_reason {
            appointment.cancel_reason = Some(reason.clone());
        }
        appointment.updated_at = now;
    }
}
