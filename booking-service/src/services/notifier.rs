//! Domain-event publishing to patients and doctors.
//!
//! Delivery itself (push, SMS, in-app hub) belongs to the notification
//! service; this side only hands events over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use service_core::observability::TracedClientExt;
use thiserror::Error;

use crate::models::Appointment;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AppointmentRequested,
    AppointmentApproved,
    AppointmentRejected,
    AppointmentConfirmed,
    AppointmentCompleted,
    AppointmentCancelled,
    PaymentOverdue,
    InvoiceIssued,
    InvoiceRefunded,
    RescheduleRequested,
    RescheduleAccepted,
    RescheduleRejected,
}

/// An appointment-level event addressed to its patient and doctor.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub appointment_id: String,
    pub recipients: Vec<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DomainEvent {
    pub fn for_appointment(kind: EventKind, appointment: &Appointment) -> Self {
        Self {
            kind,
            appointment_id: appointment.id.clone(),
            recipients: vec![appointment.patient_id.clone(), appointment.doctor_id.clone()],
            status: appointment.status.as_str().to_string(),
            invoice_id: None,
            reason: None,
        }
    }

    pub fn with_invoice(mut self, invoice_id: &str) -> Self {
        self.invoice_id = Some(invoice_id.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), NotifyError>;
}

/// Publish and swallow failures; events are advisory.
pub async fn publish_best_effort(notifier: &dyn Notifier, event: DomainEvent) {
    if let Err(e) = notifier.publish(&event).await {
        tracing::warn!(
            appointment_id = %event.appointment_id,
            kind = ?event.kind,
            error = %e,
            "Failed to publish domain event"
        );
    }
}

/// Pushes events to the notification hub over HTTP.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn publish(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .traced_post(&self.endpoint)
            .json(event)
            .timeout(Duration::from_secs(5))
            .correlation_id(&event.appointment_id)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no notification endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        tracing::info!(
            appointment_id = %event.appointment_id,
            kind = ?event.kind,
            status = %event.status,
            "Domain event (no notification endpoint configured)"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    events: Mutex<Vec<DomainEvent>>,
    fail: AtomicBool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn publish(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport("mock notifier failing".to_string()));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}
