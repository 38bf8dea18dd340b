//! Keeps appointments and schedule slots in line with invoice state.
//!
//! `sync_invoice` derives the target appointment/slot state from the
//! invoice's current status and applies it with conditional writes, so it
//! can be re-run any number of times for the same invoice. Each transition
//! leaves the invoice `synced = false` until this has completed; the sweeper
//! re-drives anything left behind.

use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoff;
use mongodb::bson::DateTime;

use crate::error::PaymentError;
use crate::models::{
    Appointment, AppointmentPatch, AppointmentStatus, Invoice, InvoiceStatus, InvoiceType,
};
use crate::services::invoices::InvoiceStateMachine;
use crate::services::notifier::{publish_best_effort, DomainEvent, EventKind, Notifier};
use crate::services::refunds::RefundGateway;
use crate::services::store::Store;

pub const SLOT_LOST: &str = "slot_lost";
pub const APPOINTMENT_CANCELLED: &str = "appointment_cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Appointment and slot already matched the invoice.
    InSync,
    Confirmed,
    Expired,
    Cancelled,
    /// A payment landed for an appointment that can no longer be honoured
    /// (slot taken after expiry, or appointment cancelled meanwhile).
    Refunded,
    /// As `Refunded`, but the refund failed and the invoice is flagged for
    /// review.
    RefundFailed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::InSync => "in_sync",
            SyncOutcome::Confirmed => "confirmed",
            SyncOutcome::Expired => "expired",
            SyncOutcome::Cancelled => "cancelled",
            SyncOutcome::Refunded => "refunded",
            SyncOutcome::RefundFailed => "refund_failed",
        }
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn Store>,
    invoices: InvoiceStateMachine,
    notifier: Arc<dyn Notifier>,
    refunds: Arc<dyn RefundGateway>,
    retry_budget: Duration,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        invoices: InvoiceStateMachine,
        notifier: Arc<dyn Notifier>,
        refunds: Arc<dyn RefundGateway>,
        retry_budget: Duration,
    ) -> Self {
        Self {
            store,
            invoices,
            notifier,
            refunds,
            retry_budget,
        }
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Re-read the invoice and synchronize it, retrying transient failures
    /// with exponential backoff until the retry budget runs out.
    pub async fn sync_invoice_with_retry(
        &self,
        invoice_id: &str,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        retry(backoff, || async {
            let invoice = match self.store.get_invoice(invoice_id).await {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    return Err(backoff::Error::permanent(PaymentError::NotFound(format!(
                        "invoice {}",
                        invoice_id
                    ))))
                }
                Err(e) => return Err(backoff::Error::transient(PaymentError::from(e))),
            };

            match self.sync_invoice(&invoice, now).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transient() => {
                    tracing::warn!(invoice_id = %invoice_id, error = %e, "Sync failed; retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// Drive the appointment and slot to the state implied by `invoice`.
    pub async fn sync_invoice(
        &self,
        invoice: &Invoice,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        let outcome = if invoice.invoice_type == InvoiceType::FinalSettlement {
            // Settlement is billed after completion; nothing to move.
            SyncOutcome::InSync
        } else {
            let appointment = self
                .store
                .get_appointment(&invoice.appointment_id)
                .await?
                .ok_or_else(|| {
                    PaymentError::NotFound(format!("appointment {}", invoice.appointment_id))
                })?;

            match invoice.status {
                InvoiceStatus::Pending => SyncOutcome::InSync,
                InvoiceStatus::Paid => self.on_paid(invoice, &appointment, now).await?,
                InvoiceStatus::PaymentOverdue => self.on_overdue(invoice, &appointment, now).await?,
                InvoiceStatus::Refunded | InvoiceStatus::Cancelled => {
                    self.on_closed(invoice, &appointment, now).await?
                }
            }
        };

        // No-op if a refund moved the invoice on in the meantime.
        if !invoice.synced {
            self.invoices.mark_synced(invoice, now).await?;
        }

        tracing::debug!(
            invoice_id = %invoice.id,
            appointment_id = %invoice.appointment_id,
            status = invoice.status.as_str(),
            outcome = outcome.as_str(),
            "Invoice synchronized"
        );
        Ok(outcome)
    }

    async fn on_paid(
        &self,
        invoice: &Invoice,
        appointment: &Appointment,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        match appointment.status {
            AppointmentStatus::Confirmed
            | AppointmentStatus::RescheduleRequested
            | AppointmentStatus::Completed => Ok(SyncOutcome::InSync),

            AppointmentStatus::PendingPayment | AppointmentStatus::PaymentOverdue => {
                // Still held for an on-time payment; re-reserved for a late one.
                let held = self
                    .store
                    .reserve_slot(&appointment.schedule_id, &appointment.id, now)
                    .await?;
                if !held {
                    tracing::warn!(
                        appointment_id = %appointment.id,
                        schedule_id = %appointment.schedule_id,
                        invoice_id = %invoice.id,
                        "Late payment but slot was taken; cancelling and refunding"
                    );
                    self.cancel_appointment(
                        appointment,
                        &[AppointmentStatus::PendingPayment, AppointmentStatus::PaymentOverdue],
                        SLOT_LOST,
                        now,
                    )
                    .await?;
                    return self.refund(invoice, appointment, SLOT_LOST, now).await;
                }

                let confirmed = self
                    .store
                    .update_appointment_if(
                        &appointment.id,
                        &[AppointmentStatus::PendingPayment, AppointmentStatus::PaymentOverdue],
                        &AppointmentPatch::status(AppointmentStatus::Confirmed),
                        now,
                    )
                    .await?;

                match confirmed {
                    Some(confirmed) => {
                        tracing::info!(
                            appointment_id = %confirmed.id,
                            invoice_id = %invoice.id,
                            "Appointment confirmed"
                        );
                        publish_best_effort(
                            self.notifier(),
                            DomainEvent::for_appointment(EventKind::AppointmentConfirmed, &confirmed)
                                .with_invoice(&invoice.id),
                        )
                        .await;
                        Ok(SyncOutcome::Confirmed)
                    }
                    None => {
                        // Moved underneath us (e.g. cancelled); settle against that.
                        let current = self
                            .store
                            .get_appointment(&appointment.id)
                            .await?
                            .ok_or_else(|| {
                                PaymentError::NotFound(format!("appointment {}", appointment.id))
                            })?;
                        if current.status == AppointmentStatus::Cancelled {
                            self.release_all(&current, now).await?;
                            self.refund(invoice, &current, APPOINTMENT_CANCELLED, now).await
                        } else {
                            Ok(SyncOutcome::InSync)
                        }
                    }
                }
            }

            AppointmentStatus::Cancelled => {
                self.release_all(appointment, now).await?;
                let reason = match appointment.cancel_reason.as_deref() {
                    Some(SLOT_LOST) => SLOT_LOST,
                    _ => APPOINTMENT_CANCELLED,
                };
                self.refund(invoice, appointment, reason, now).await
            }

            AppointmentStatus::Requested => {
                tracing::warn!(
                    appointment_id = %appointment.id,
                    invoice_id = %invoice.id,
                    "Paid invoice for an appointment still awaiting approval"
                );
                Ok(SyncOutcome::InSync)
            }
        }
    }

    async fn on_overdue(
        &self,
        invoice: &Invoice,
        appointment: &Appointment,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        // Pin the hold we intend to release: a late payment that re-reserves
        // the slot after this read bumps the version and keeps it.
        let hold_version = self
            .store
            .get_slot(&appointment.schedule_id)
            .await?
            .filter(|slot| slot.is_held_by(&appointment.id))
            .map(|slot| slot.hold_version);

        let expired = self
            .store
            .update_appointment_if(
                &appointment.id,
                &[AppointmentStatus::PendingPayment],
                &AppointmentPatch::status(AppointmentStatus::PaymentOverdue),
                now,
            )
            .await?;

        let should_release = match &expired {
            Some(_) => true,
            None => self
                .store
                .get_appointment(&appointment.id)
                .await?
                .is_some_and(|current| {
                    matches!(
                        current.status,
                        AppointmentStatus::PaymentOverdue | AppointmentStatus::Cancelled
                    )
                }),
        };

        let released = match hold_version {
            Some(version) if should_release => {
                self.store
                    .release_slot(&appointment.schedule_id, &appointment.id, Some(version), now)
                    .await?
            }
            _ => false,
        };

        match expired {
            Some(expired) => {
                tracing::info!(
                    appointment_id = %expired.id,
                    invoice_id = %invoice.id,
                    slot_released = released,
                    "Appointment payment overdue"
                );
                publish_best_effort(
                    self.notifier(),
                    DomainEvent::for_appointment(EventKind::PaymentOverdue, &expired)
                        .with_invoice(&invoice.id),
                )
                .await;
                Ok(SyncOutcome::Expired)
            }
            None => Ok(SyncOutcome::InSync),
        }
    }

    async fn on_closed(
        &self,
        invoice: &Invoice,
        appointment: &Appointment,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        let reason = match invoice.status {
            InvoiceStatus::Refunded => invoice
                .refund_reason
                .clone()
                .unwrap_or_else(|| "invoice_refunded".to_string()),
            _ => "invoice_cancelled".to_string(),
        };

        let cancelled = self
            .cancel_appointment(appointment, &AppointmentStatus::CANCELLABLE, &reason, now)
            .await?;

        if appointment.status != AppointmentStatus::Completed {
            self.release_all(appointment, now).await?;
        }

        Ok(if cancelled {
            SyncOutcome::Cancelled
        } else {
            SyncOutcome::InSync
        })
    }

    /// Cancel the appointment if it is still in one of `from`. Returns
    /// whether this call made the change.
    pub async fn cancel_appointment(
        &self,
        appointment: &Appointment,
        from: &[AppointmentStatus],
        reason: &str,
        now: DateTime,
    ) -> Result<bool, PaymentError> {
        let cancelled = self
            .store
            .update_appointment_if(&appointment.id, from, &AppointmentPatch::cancelled(reason), now)
            .await?;

        let Some(cancelled) = cancelled else {
            return Ok(false);
        };

        // The updated document carries whatever slots it held at cancellation.
        self.release_after_commit(&cancelled.schedule_id, &cancelled.id, now)
            .await;
        if let Some(proposed) = &cancelled.proposed_schedule_id {
            self.release_after_commit(proposed, &cancelled.id, now).await;
        }
        tracing::info!(appointment_id = %cancelled.id, reason = %reason, "Appointment cancelled");
        publish_best_effort(
            self.notifier(),
            DomainEvent::for_appointment(EventKind::AppointmentCancelled, &cancelled)
                .with_reason(reason),
        )
        .await;
        Ok(true)
    }

    /// Release every slot the appointment may hold: its own and a tentative
    /// reschedule slot. Holder-conditional, so safe to repeat.
    pub async fn release_all(&self, appointment: &Appointment, now: DateTime) -> Result<(), PaymentError> {
        self.release_with_retry(&appointment.schedule_id, &appointment.id, now)
            .await?;
        if let Some(proposed) = &appointment.proposed_schedule_id {
            self.release_with_retry(proposed, &appointment.id, now)
                .await?;
        }
        Ok(())
    }

    /// Holder-conditional release, retried with backoff on store failures.
    pub async fn release_with_retry(
        &self,
        slot_id: &str,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<bool, PaymentError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        retry(backoff, || async {
            self.store
                .release_slot(slot_id, appointment_id, None, now)
                .await
                .map_err(|e| {
                    tracing::warn!(slot_id = %slot_id, error = %e, "Slot release failed; retrying");
                    backoff::Error::transient(PaymentError::from(e))
                })
        })
        .await
    }

    /// Release a slot after the appointment write that gave it up has
    /// committed. The caller has nothing left to undo, so a failure that
    /// outlasts the retry budget is only logged; the sweeper frees slots
    /// whose holder no longer claims them.
    pub async fn release_after_commit(&self, slot_id: &str, appointment_id: &str, now: DateTime) {
        if let Err(e) = self.release_with_retry(slot_id, appointment_id, now).await {
            tracing::error!(
                slot_id = %slot_id,
                appointment_id = %appointment_id,
                error = %e,
                "Slot release failed; left for the sweeper"
            );
        }
    }

    async fn refund(
        &self,
        invoice: &Invoice,
        appointment: &Appointment,
        reason: &str,
        now: DateTime,
    ) -> Result<SyncOutcome, PaymentError> {
        match self
            .invoices
            .refund(&invoice.id, reason, self.refunds.as_ref(), now)
            .await
        {
            Ok(refunded) => {
                // Appointment and slots were settled before refunding.
                self.invoices.mark_synced(&refunded, now).await?;
                publish_best_effort(
                    self.notifier(),
                    DomainEvent::for_appointment(EventKind::InvoiceRefunded, appointment)
                        .with_invoice(&refunded.id)
                        .with_reason(reason),
                )
                .await;
                Ok(SyncOutcome::Refunded)
            }
            Err(PaymentError::RefundFailed(e)) => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    reason = %reason,
                    error = %e,
                    "Refund failed; invoice left paid for manual review"
                );
                Ok(SyncOutcome::RefundFailed)
            }
            Err(e) => Err(e),
        }
    }
}
