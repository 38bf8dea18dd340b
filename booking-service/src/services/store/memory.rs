use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use mongodb::bson::DateTime;

use super::{ClaimResult, Store, StoreError};
use crate::models::{
    Appointment, AppointmentPatch, AppointmentStatus, Invoice, InvoicePatch, InvoiceStatus,
    InvoiceType, LedgerEntry, LedgerOutcome, ScheduleSlot,
};

#[derive(Default)]
struct Tables {
    invoices: HashMap<String, Invoice>,
    appointments: HashMap<String, Appointment>,
    slots: HashMap<String, ScheduleSlot>,
    ledger: HashMap<String, LedgerEntry>,
}

/// In-process store with the same conditional-write semantics (and unique
/// constraints) as the MongoDB collections. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failures: AtomicU32,
    release_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with a backend error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `release_slot` calls fail, leaving other calls alone.
    pub fn fail_releases(&self, n: u32) {
        self.release_failures.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected store failure"
            )));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("memory store poisoned")))
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

fn take<T>(items: Vec<T>, limit: i64) -> Vec<T> {
    items.into_iter().take(limit.max(0) as usize).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let clash = tables.invoices.values().any(|existing| {
            existing.id == invoice.id
                || existing.reference_code == invoice.reference_code
                || (invoice.status == InvoiceStatus::Pending
                    && existing.status == InvoiceStatus::Pending
                    && existing.appointment_id == invoice.appointment_id
                    && existing.invoice_type == invoice.invoice_type)
        });
        if clash {
            return Err(StoreError::Duplicate(
                "pending invoice or reference_code".to_string(),
            ));
        }
        tables.invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self.lock()?.invoices.get(id).cloned())
    }

    async fn find_invoice_by_reference(
        &self,
        reference_code: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .lock()?
            .invoices
            .values()
            .find(|i| i.reference_code == reference_code)
            .cloned())
    }

    async fn find_invoice_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .lock()?
            .invoices
            .values()
            .find(|i| i.gateway_ref.as_deref() == Some(gateway_ref))
            .cloned())
    }

    async fn list_invoices_for_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        let tables = self.lock()?;
        let invoices = tables
            .invoices
            .values()
            .filter(|i| i.appointment_id == appointment_id)
            .cloned()
            .collect();
        Ok(sorted_by(invoices, |i| i.created_at))
    }

    async fn update_invoice_if(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        patch: &InvoicePatch,
        now: DateTime,
    ) -> Result<Option<Invoice>, StoreError> {
        let mut tables = self.lock()?;

        if let Some(gateway_ref) = &patch.gateway_ref {
            let taken = tables
                .invoices
                .values()
                .any(|i| i.id != id && i.gateway_ref.as_deref() == Some(gateway_ref.as_str()));
            if taken {
                return Err(StoreError::Duplicate("gateway_ref".to_string()));
            }
        }

        match tables.invoices.get_mut(id) {
            Some(invoice) if expected.contains(&invoice.status) => {
                patch.apply(invoice, now);
                Ok(Some(invoice.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_due_invoices(
        &self,
        invoice_type: InvoiceType,
        now: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError> {
        let tables = self.lock()?;
        let due = tables
            .invoices
            .values()
            .filter(|i| {
                i.status == InvoiceStatus::Pending
                    && i.invoice_type == invoice_type
                    && i.due_date <= now
            })
            .cloned()
            .collect();
        Ok(take(sorted_by(due, |i| i.due_date), limit))
    }

    async fn find_unsynced_invoices(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError> {
        let tables = self.lock()?;
        let unsynced = tables
            .invoices
            .values()
            .filter(|i| !i.synced && i.updated_at <= updated_before)
            .cloned()
            .collect();
        Ok(take(sorted_by(unsynced, |i| i.updated_at), limit))
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.appointments.contains_key(&appointment.id) {
            return Err(StoreError::Duplicate("appointment".to_string()));
        }
        tables
            .appointments
            .insert(appointment.id.clone(), appointment.clone());
        Ok(())
    }

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        Ok(self.lock()?.appointments.get(id).cloned())
    }

    async fn update_appointment_if(
        &self,
        id: &str,
        expected: &[AppointmentStatus],
        patch: &AppointmentPatch,
        now: DateTime,
    ) -> Result<Option<Appointment>, StoreError> {
        let mut tables = self.lock()?;
        match tables.appointments.get_mut(id) {
            Some(appointment) if expected.contains(&appointment.status) => {
                patch.apply(appointment, now);
                Ok(Some(appointment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_slot(&self, slot: &ScheduleSlot) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.slots.contains_key(&slot.id) {
            return Err(StoreError::Duplicate("slot".to_string()));
        }
        tables.slots.insert(slot.id.clone(), slot.clone());
        Ok(())
    }

    async fn get_slot(&self, id: &str) -> Result<Option<ScheduleSlot>, StoreError> {
        Ok(self.lock()?.slots.get(id).cloned())
    }

    async fn reserve_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        match tables.slots.get_mut(slot_id) {
            Some(slot) if !slot.is_booked || slot.held_by.as_deref() == Some(appointment_id) => {
                slot.is_booked = true;
                slot.held_by = Some(appointment_id.to_string());
                slot.hold_version += 1;
                slot.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        hold_version: Option<i64>,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        if self
            .release_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected release failure"
            )));
        }
        let mut tables = self.lock()?;
        match tables.slots.get_mut(slot_id) {
            Some(slot)
                if slot.held_by.as_deref() == Some(appointment_id)
                    && hold_version.map_or(true, |v| v == slot.hold_version) =>
            {
                slot.is_booked = false;
                slot.held_by = None;
                slot.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_held_slots(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<ScheduleSlot>, StoreError> {
        let tables = self.lock()?;
        let held = tables
            .slots
            .values()
            .filter(|s| s.is_booked && s.updated_at <= updated_before)
            .cloned()
            .collect();
        Ok(take(sorted_by(held, |s| s.updated_at), limit))
    }

    async fn claim_ledger(
        &self,
        entry: &LedgerEntry,
        stale_before: DateTime,
    ) -> Result<ClaimResult, StoreError> {
        let mut tables = self.lock()?;
        let Some(existing) = tables.ledger.get_mut(&entry.key) else {
            tables.ledger.insert(entry.key.clone(), entry.clone());
            return Ok(ClaimResult::Claimed);
        };

        if existing.outcome == LedgerOutcome::InProgress && existing.claimed_at <= stale_before {
            existing.claimed_at = entry.claimed_at;
            return Ok(ClaimResult::Reclaimed);
        }

        existing.duplicate_count += 1;
        Ok(ClaimResult::Held(existing.clone()))
    }

    async fn seal_ledger(
        &self,
        key: &str,
        claimed_at: DateTime,
        outcome: LedgerOutcome,
        invoice_id: Option<&str>,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        match tables.ledger.get_mut(key) {
            Some(entry)
                if entry.outcome == LedgerOutcome::InProgress && entry.claimed_at == claimed_at =>
            {
                entry.outcome = outcome;
                entry.processed_at = Some(now);
                entry.invoice_id = invoice_id.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abandon_ledger(&self, key: &str, claimed_at: DateTime) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let owned = tables.ledger.get(key).is_some_and(|entry| {
            entry.outcome == LedgerOutcome::InProgress && entry.claimed_at == claimed_at
        });
        if owned {
            tables.ledger.remove(key);
        }
        Ok(owned)
    }

    async fn get_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.lock()?.ledger.get(key).cloned())
    }

    async fn find_stale_claims(
        &self,
        stale_before: DateTime,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .ledger
            .values()
            .filter(|e| e.outcome == LedgerOutcome::InProgress && e.claimed_at <= stale_before)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
