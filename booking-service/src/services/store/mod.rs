//! Persistence seam for invoices, appointments, schedule slots and the
//! idempotency ledger.
//!
//! Every state change goes through a conditional write (`*_if`, `reserve_slot`,
//! `release_slot`, `claim_ledger`): the filter and the update are evaluated
//! against the same document snapshot, which is what keeps concurrent
//! gateway deliveries, sweeps and doctor actions from trampling each other.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use mongodb::bson::DateTime;
use thiserror::Error;

use crate::models::{
    Appointment, AppointmentPatch, AppointmentStatus, Invoice, InvoicePatch, InvoiceStatus,
    InvoiceType, LedgerEntry, LedgerOutcome, ScheduleSlot,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected the write; carries the offending field.
    #[error("duplicate {0}")]
    Duplicate(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Outcome of claiming a ledger key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    Claimed,
    /// Took over an in-progress claim older than the stale bound.
    Reclaimed,
    /// Someone else holds (or has finished) this key; the entry is returned
    /// with its duplicate counter already bumped.
    Held(LedgerEntry),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;
    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, StoreError>;
    async fn find_invoice_by_reference(
        &self,
        reference_code: &str,
    ) -> Result<Option<Invoice>, StoreError>;
    async fn find_invoice_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<Invoice>, StoreError>;
    async fn list_invoices_for_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Vec<Invoice>, StoreError>;
    /// Apply `patch` only while the invoice is in one of `expected`.
    /// Returns the updated invoice, or `None` when the guard did not match.
    async fn update_invoice_if(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        patch: &InvoicePatch,
        now: DateTime,
    ) -> Result<Option<Invoice>, StoreError>;
    /// Pending invoices of `invoice_type` whose due date is at or before `now`.
    async fn find_due_invoices(
        &self,
        invoice_type: InvoiceType,
        now: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError>;
    async fn find_unsynced_invoices(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError>;

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError>;
    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>, StoreError>;
    async fn update_appointment_if(
        &self,
        id: &str,
        expected: &[AppointmentStatus],
        patch: &AppointmentPatch,
        now: DateTime,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn insert_slot(&self, slot: &ScheduleSlot) -> Result<(), StoreError>;
    async fn get_slot(&self, id: &str) -> Result<Option<ScheduleSlot>, StoreError>;
    /// Book the slot for `appointment_id` if it is free or already held by it.
    async fn reserve_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<bool, StoreError>;
    /// Free the slot only if `appointment_id` is the current holder and, when
    /// given, the hold is still at `hold_version`.
    async fn release_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        hold_version: Option<i64>,
        now: DateTime,
    ) -> Result<bool, StoreError>;
    /// Booked slots whose hold was last touched at or before `updated_before`.
    async fn find_held_slots(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<ScheduleSlot>, StoreError>;

    /// Insert an in-progress claim, or take over one whose `claimed_at` is at
    /// or before `stale_before`.
    async fn claim_ledger(
        &self,
        entry: &LedgerEntry,
        stale_before: DateTime,
    ) -> Result<ClaimResult, StoreError>;
    /// Seal the claim made at `claimed_at`. Returns `false` if the claim was
    /// lost to a reclaim or already sealed.
    async fn seal_ledger(
        &self,
        key: &str,
        claimed_at: DateTime,
        outcome: LedgerOutcome,
        invoice_id: Option<&str>,
        now: DateTime,
    ) -> Result<bool, StoreError>;
    /// Delete the in-progress claim made at `claimed_at`.
    async fn abandon_ledger(&self, key: &str, claimed_at: DateTime) -> Result<bool, StoreError>;
    async fn get_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>, StoreError>;
    async fn find_stale_claims(
        &self,
        stale_before: DateTime,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}
