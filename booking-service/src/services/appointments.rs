//! Patient and doctor actions on appointments and schedule slots.
//!
//! Payment-driven appointment transitions live in the synchronizer; the
//! operations here are the explicit ones (book, approve, complete, cancel,
//! reschedule negotiation).

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use mongodb::bson::DateTime;

use crate::config::{BookingConfig, PaymentsConfig};
use crate::error::PaymentError;
use crate::models::{
    shift_secs, Actor, Appointment, AppointmentPatch, AppointmentStatus, Invoice, InvoiceStatus,
    InvoiceType, Role, ScheduleSlot,
};
use crate::services::invoices::InvoiceStateMachine;
use crate::services::notifier::{publish_best_effort, DomainEvent, EventKind};
use crate::services::store::Store;
use crate::services::synchronizer::Synchronizer;

pub const REJECTED_BY_DOCTOR: &str = "rejected_by_doctor";

#[derive(Debug, Clone)]
pub struct Booking {
    pub appointment: Appointment,
    pub invoice: Option<Invoice>,
}

#[derive(Clone)]
pub struct AppointmentService {
    store: Arc<dyn Store>,
    invoices: InvoiceStateMachine,
    synchronizer: Synchronizer,
    booking: BookingConfig,
    payments: PaymentsConfig,
}

impl AppointmentService {
    pub fn new(
        store: Arc<dyn Store>,
        invoices: InvoiceStateMachine,
        synchronizer: Synchronizer,
        booking: BookingConfig,
        payments: PaymentsConfig,
    ) -> Self {
        Self {
            store,
            invoices,
            synchronizer,
            booking,
            payments,
        }
    }

    async fn load(&self, appointment_id: &str) -> Result<Appointment, PaymentError> {
        self.store
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("appointment {}", appointment_id)))
    }

    async fn load_slot(&self, slot_id: &str) -> Result<ScheduleSlot, PaymentError> {
        self.store
            .get_slot(slot_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("slot {}", slot_id)))
    }

    async fn notify(&self, kind: EventKind, appointment: &Appointment) {
        publish_best_effort(
            self.synchronizer.notifier(),
            DomainEvent::for_appointment(kind, appointment),
        )
        .await;
    }

    fn due_date(&self, now: DateTime) -> DateTime {
        shift_secs(now, self.payments.invoice_due_minutes * 60)
    }

    async fn issue_consultation(
        &self,
        appointment: &Appointment,
        now: DateTime,
    ) -> Result<Invoice, PaymentError> {
        self.invoices
            .issue(
                &appointment.id,
                InvoiceType::Consultation,
                self.booking.consultation_fee,
                &self.payments.currency,
                self.due_date(now),
                now,
            )
            .await
    }

    /// Appointment visible to `actor`: its patient, its doctor, or an admin.
    pub async fn get(&self, actor: &Actor, appointment_id: &str) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        if !actor.is_admin() && !appointment.involves(&actor.user_id) {
            return Err(PaymentError::Forbidden(
                "appointment belongs to another user".to_string(),
            ));
        }
        Ok(appointment)
    }

    pub async fn create_slot(
        &self,
        actor: &Actor,
        doctor_id: Option<&str>,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        now: DateTime,
    ) -> Result<ScheduleSlot, PaymentError> {
        let doctor_id = match actor.role {
            Role::Doctor => actor.user_id.as_str(),
            Role::Admin => doctor_id.ok_or_else(|| {
                PaymentError::MalformedPayload("doctor_id is required".to_string())
            })?,
            Role::Patient => {
                return Err(PaymentError::Forbidden("only doctors publish slots".to_string()))
            }
        };
        if end_time <= start_time {
            return Err(PaymentError::MalformedPayload(
                "end_time must be after start_time".to_string(),
            ));
        }

        let slot = ScheduleSlot::new(doctor_id, date, start_time, end_time, now);
        self.store.insert_slot(&slot).await?;
        tracing::info!(slot_id = %slot.id, doctor_id = %doctor_id, "Schedule slot created");
        Ok(slot)
    }

    pub async fn get_slot(&self, slot_id: &str) -> Result<ScheduleSlot, PaymentError> {
        self.load_slot(slot_id).await
    }

    /// Book a slot for the calling patient. The slot is reserved with a
    /// single conditional write; the appointment starts `requested` or
    /// `pending_payment` with a consultation invoice.
    pub async fn book(
        &self,
        actor: &Actor,
        slot_id: &str,
        now: DateTime,
    ) -> Result<Booking, PaymentError> {
        if actor.role != Role::Patient {
            return Err(PaymentError::Forbidden("only patients can book".to_string()));
        }
        let slot = self.load_slot(slot_id).await?;

        let status = if self.booking.require_doctor_approval {
            AppointmentStatus::Requested
        } else {
            AppointmentStatus::PendingPayment
        };
        let appointment = Appointment::new(&actor.user_id, &slot.doctor_id, &slot.id, status, now);

        if !self.store.reserve_slot(&slot.id, &appointment.id, now).await? {
            return Err(PaymentError::SlotConflict(slot.id));
        }

        if let Err(e) = self.store.insert_appointment(&appointment).await {
            self.store
                .release_slot(&slot.id, &appointment.id, None, now)
                .await?;
            return Err(e.into());
        }

        let invoice = if status == AppointmentStatus::PendingPayment {
            match self.issue_consultation(&appointment, now).await {
                Ok(invoice) => Some(invoice),
                Err(e) => {
                    self.synchronizer
                        .cancel_appointment(
                            &appointment,
                            &[AppointmentStatus::PendingPayment],
                            "invoice_failed",
                            now,
                        )
                        .await?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(
            appointment_id = %appointment.id,
            patient_id = %appointment.patient_id,
            doctor_id = %appointment.doctor_id,
            schedule_id = %appointment.schedule_id,
            status = appointment.status.as_str(),
            "Appointment booked"
        );
        let event = match &invoice {
            Some(invoice) => DomainEvent::for_appointment(EventKind::InvoiceIssued, &appointment)
                .with_invoice(&invoice.id),
            None => DomainEvent::for_appointment(EventKind::AppointmentRequested, &appointment),
        };
        publish_best_effort(self.synchronizer.notifier(), event).await;

        Ok(Booking {
            appointment,
            invoice,
        })
    }

    fn ensure_doctor(&self, actor: &Actor, appointment: &Appointment) -> Result<(), PaymentError> {
        if actor.is_admin() || (actor.role == Role::Doctor && appointment.doctor_id == actor.user_id) {
            Ok(())
        } else {
            Err(PaymentError::Forbidden(
                "only the appointment's doctor can do this".to_string(),
            ))
        }
    }

    fn ensure_patient(&self, actor: &Actor, appointment: &Appointment) -> Result<(), PaymentError> {
        if actor.is_admin()
            || (actor.role == Role::Patient && appointment.patient_id == actor.user_id)
        {
            Ok(())
        } else {
            Err(PaymentError::Forbidden(
                "only the appointment's patient can do this".to_string(),
            ))
        }
    }

    fn invalid(appointment: &Appointment, action: &str) -> PaymentError {
        PaymentError::InvalidTransition(format!(
            "cannot {} appointment {} in status {}",
            action, appointment.id, appointment.status
        ))
    }

    /// Doctor accepts a requested appointment; billing starts now.
    pub async fn approve(
        &self,
        actor: &Actor,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<Booking, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_doctor(actor, &appointment)?;
        if appointment.status != AppointmentStatus::Requested {
            return Err(Self::invalid(&appointment, "approve"));
        }

        // Invoice first: an approved appointment must never lack one.
        let invoice = self.issue_consultation(&appointment, now).await?;

        let approved = self
            .store
            .update_appointment_if(
                &appointment.id,
                &[AppointmentStatus::Requested],
                &AppointmentPatch::status(AppointmentStatus::PendingPayment),
                now,
            )
            .await?;

        let Some(approved) = approved else {
            self.invoices.cancel(&invoice.id, now).await?;
            let current = self.load(appointment_id).await?;
            return Err(Self::invalid(&current, "approve"));
        };

        tracing::info!(appointment_id = %approved.id, invoice_id = %invoice.id, "Appointment approved");
        publish_best_effort(
            self.synchronizer.notifier(),
            DomainEvent::for_appointment(EventKind::AppointmentApproved, &approved)
                .with_invoice(&invoice.id),
        )
        .await;

        Ok(Booking {
            appointment: approved,
            invoice: Some(invoice),
        })
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_doctor(actor, &appointment)?;

        let rejected = self
            .synchronizer
            .cancel_appointment(
                &appointment,
                &[AppointmentStatus::Requested],
                REJECTED_BY_DOCTOR,
                now,
            )
            .await?;
        let current = self.load(appointment_id).await?;
        if !rejected {
            return Err(Self::invalid(&current, "reject"));
        }
        self.notify(EventKind::AppointmentRejected, &current).await;
        Ok(current)
    }

    /// Doctor marks a confirmed appointment done, optionally billing a final
    /// settlement.
    pub async fn complete(
        &self,
        actor: &Actor,
        appointment_id: &str,
        settlement_amount: Option<i64>,
        now: DateTime,
    ) -> Result<Booking, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_doctor(actor, &appointment)?;

        let completed = self
            .store
            .update_appointment_if(
                &appointment.id,
                &[AppointmentStatus::Confirmed],
                &AppointmentPatch::status(AppointmentStatus::Completed),
                now,
            )
            .await?
            .ok_or_else(|| Self::invalid(&appointment, "complete"))?;

        let invoice = match settlement_amount.filter(|amount| *amount > 0) {
            Some(amount) => Some(
                self.invoices
                    .issue(
                        &completed.id,
                        InvoiceType::FinalSettlement,
                        amount,
                        &self.payments.currency,
                        self.due_date(now),
                        now,
                    )
                    .await?,
            ),
            None => None,
        };

        tracing::info!(appointment_id = %completed.id, "Appointment completed");
        self.notify(EventKind::AppointmentCompleted, &completed).await;
        Ok(Booking {
            appointment: completed,
            invoice,
        })
    }

    /// Cancel on behalf of the patient or doctor. Releases every slot the
    /// appointment holds and cancels its unpaid invoices.
    pub async fn cancel(
        &self,
        actor: &Actor,
        appointment_id: &str,
        reason: Option<&str>,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.get(actor, appointment_id).await?;
        let reason = reason.unwrap_or(match actor.role {
            Role::Patient => "cancelled_by_patient",
            Role::Doctor => "cancelled_by_doctor",
            Role::Admin => "cancelled_by_admin",
        });

        let cancelled = self
            .synchronizer
            .cancel_appointment(&appointment, &AppointmentStatus::CANCELLABLE, reason, now)
            .await?;
        if !cancelled {
            return Err(Self::invalid(&appointment, "cancel"));
        }

        for invoice in self.store.list_invoices_for_appointment(&appointment.id).await? {
            if !InvoiceStatus::PAYABLE.contains(&invoice.status) {
                continue;
            }
            if let Some(closed) = self.invoices.cancel(&invoice.id, now).await? {
                // Left unsynced on failure; the sweeper's resync pass finishes it.
                if let Err(e) = self.synchronizer.sync_invoice(&closed, now).await {
                    tracing::warn!(invoice_id = %closed.id, error = %e, "Sync after cancel failed");
                }
            }
        }

        self.load(appointment_id).await
    }

    /// Doctor proposes moving a confirmed appointment to `new_slot_id`. The
    /// new slot is held tentatively; the current one stays booked.
    pub async fn request_reschedule(
        &self,
        actor: &Actor,
        appointment_id: &str,
        new_slot_id: &str,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_doctor(actor, &appointment)?;
        if appointment.status != AppointmentStatus::Confirmed {
            return Err(Self::invalid(&appointment, "reschedule"));
        }

        let slot = self.load_slot(new_slot_id).await?;
        if slot.doctor_id != appointment.doctor_id {
            return Err(PaymentError::Forbidden(
                "slot belongs to another doctor".to_string(),
            ));
        }
        if slot.id == appointment.schedule_id {
            return Err(PaymentError::Conflict(
                "appointment already uses this slot".to_string(),
            ));
        }
        if !self.store.reserve_slot(&slot.id, &appointment.id, now).await? {
            return Err(PaymentError::SlotConflict(slot.id));
        }

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::RescheduleRequested),
            proposed_schedule_id: Some(Some(slot.id.clone())),
            reschedule_requested_at: Some(Some(now)),
            ..Default::default()
        };
        let requested = self
            .store
            .update_appointment_if(&appointment.id, &[AppointmentStatus::Confirmed], &patch, now)
            .await?;

        let Some(requested) = requested else {
            self.store
                .release_slot(&slot.id, &appointment.id, None, now)
                .await?;
            let current = self.load(appointment_id).await?;
            return Err(Self::invalid(&current, "reschedule"));
        };

        tracing::info!(
            appointment_id = %requested.id,
            from_slot = %requested.schedule_id,
            to_slot = %slot.id,
            "Reschedule requested"
        );
        self.notify(EventKind::RescheduleRequested, &requested).await;
        Ok(requested)
    }

    pub async fn accept_reschedule(
        &self,
        actor: &Actor,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_patient(actor, &appointment)?;
        self.finalize_reschedule(&appointment, now).await
    }

    /// Patient declines: back to the original slot, tentative slot freed.
    pub async fn reject_reschedule(
        &self,
        actor: &Actor,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_patient(actor, &appointment)?;
        let proposed = appointment
            .proposed_schedule_id
            .clone()
            .filter(|_| appointment.status == AppointmentStatus::RescheduleRequested)
            .ok_or_else(|| Self::invalid(&appointment, "reject reschedule of"))?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Confirmed),
            proposed_schedule_id: Some(None),
            reschedule_requested_at: Some(None),
            ..Default::default()
        };
        let reverted = self
            .store
            .update_appointment_if(
                &appointment.id,
                &[AppointmentStatus::RescheduleRequested],
                &patch,
                now,
            )
            .await?
            .ok_or_else(|| Self::invalid(&appointment, "reject reschedule of"))?;

        self.synchronizer
            .release_after_commit(&proposed, &appointment.id, now)
            .await;

        tracing::info!(
            appointment_id = %reverted.id,
            released_slot = %proposed,
            "Reschedule rejected"
        );
        self.notify(EventKind::RescheduleRejected, &reverted).await;
        Ok(reverted)
    }

    /// Doctor accepts their own proposal once the patient has had
    /// `reschedule_auto_accept_secs` to respond.
    pub async fn self_accept_reschedule(
        &self,
        actor: &Actor,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let appointment = self.load(appointment_id).await?;
        self.ensure_doctor(actor, &appointment)?;

        let Some(wait_secs) = self.booking.reschedule_auto_accept_secs else {
            return Err(PaymentError::Forbidden(
                "self-accepting reschedules is disabled".to_string(),
            ));
        };
        let requested_at = appointment
            .reschedule_requested_at
            .filter(|_| appointment.status == AppointmentStatus::RescheduleRequested)
            .ok_or_else(|| Self::invalid(&appointment, "self-accept reschedule of"))?;
        if shift_secs(requested_at, wait_secs) > now {
            return Err(PaymentError::InvalidTransition(format!(
                "patient still has until {} to respond",
                crate::models::rfc3339(shift_secs(requested_at, wait_secs))
            )));
        }

        self.finalize_reschedule(&appointment, now).await
    }

    async fn finalize_reschedule(
        &self,
        appointment: &Appointment,
        now: DateTime,
    ) -> Result<Appointment, PaymentError> {
        let proposed = appointment
            .proposed_schedule_id
            .clone()
            .filter(|_| appointment.status == AppointmentStatus::RescheduleRequested)
            .ok_or_else(|| Self::invalid(appointment, "accept reschedule of"))?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Confirmed),
            schedule_id: Some(proposed.clone()),
            proposed_schedule_id: Some(None),
            reschedule_requested_at: Some(None),
            ..Default::default()
        };
        let moved = self
            .store
            .update_appointment_if(
                &appointment.id,
                &[AppointmentStatus::RescheduleRequested],
                &patch,
                now,
            )
            .await?
            .ok_or_else(|| Self::invalid(appointment, "accept reschedule of"))?;

        self.synchronizer
            .release_after_commit(&appointment.schedule_id, &appointment.id, now)
            .await;

        tracing::info!(
            appointment_id = %moved.id,
            released_slot = %appointment.schedule_id,
            schedule_id = %moved.schedule_id,
            "Reschedule accepted"
        );
        self.notify(EventKind::RescheduleAccepted, &moved).await;
        Ok(moved)
    }
}
