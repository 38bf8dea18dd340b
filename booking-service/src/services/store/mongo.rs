use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};

use super::{ClaimResult, Store, StoreError};
use crate::models::{
    Appointment, AppointmentPatch, AppointmentStatus, Invoice, InvoicePatch, InvoiceStatus,
    InvoiceType, LedgerEntry, LedgerOutcome, ScheduleSlot,
};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    invoices: Collection<Invoice>,
    appointments: Collection<Appointment>,
    slots: Collection<ScheduleSlot>,
    ledger: Collection<LedgerEntry>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            invoices: db.collection("invoices"),
            appointments: db.collection("appointments"),
            slots: db.collection("schedules"),
            ledger: db.collection("payment_ledger"),
        }
    }

    /// Create the indexes the conditional writes rely on.
    pub async fn init_indexes(&self) -> anyhow::Result<()> {
        // One pending invoice per (appointment, type)
        let pending_per_type = IndexModel::builder()
            .keys(doc! { "appointment_id": 1, "type": 1 })
            .options(
                IndexOptions::builder()
                    .name("pending_invoice_per_type_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "status": "pending" })
                    .build(),
            )
            .build();

        let reference_code = IndexModel::builder()
            .keys(doc! { "reference_code": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_reference_code_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        // gateway_ref is absent until paid; only set values participate
        let gateway_ref = IndexModel::builder()
            .keys(doc! { "gateway_ref": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_gateway_ref_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "gateway_ref": { "$type": "string" } })
                    .build(),
            )
            .build();

        let due = IndexModel::builder()
            .keys(doc! { "status": 1, "type": 1, "due_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_due_idx".to_string())
                    .build(),
            )
            .build();

        let unsynced = IndexModel::builder()
            .keys(doc! { "synced": 1, "updated_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_unsynced_idx".to_string())
                    .build(),
            )
            .build();

        self.invoices
            .create_indexes(
                [pending_per_type, reference_code, gateway_ref, due, unsynced],
                None,
            )
            .await?;

        let patient = IndexModel::builder()
            .keys(doc! { "patient_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("appointment_patient_idx".to_string())
                    .build(),
            )
            .build();
        let doctor = IndexModel::builder()
            .keys(doc! { "doctor_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("appointment_doctor_idx".to_string())
                    .build(),
            )
            .build();
        self.appointments
            .create_indexes([patient, doctor], None)
            .await?;

        let doctor_day = IndexModel::builder()
            .keys(doc! { "doctor_id": 1, "date": 1, "start_time": 1 })
            .options(
                IndexOptions::builder()
                    .name("schedule_doctor_day_idx".to_string())
                    .build(),
            )
            .build();
        let held = IndexModel::builder()
            .keys(doc! { "is_booked": 1, "updated_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("schedule_held_idx".to_string())
                    .build(),
            )
            .build();
        self.slots.create_indexes([doctor_day, held], None).await?;

        let stale_claims = IndexModel::builder()
            .keys(doc! { "outcome": 1, "claimed_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("ledger_stale_claim_idx".to_string())
                    .build(),
            )
            .build();
        self.ledger.create_indexes([stale_claims], None).await?;

        tracing::info!("Booking service indexes initialized");
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Map a driver error, naming the unique field when it was a key violation.
fn store_err(err: mongodb::error::Error, unique_field: &str) -> StoreError {
    if is_duplicate_key(&err) {
        StoreError::Duplicate(unique_field.to_string())
    } else {
        StoreError::Backend(err.into())
    }
}

fn backend(err: mongodb::error::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn bson_err(err: mongodb::bson::ser::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn status_list<T: serde::Serialize>(statuses: &[T]) -> Result<Vec<mongodb::bson::Bson>, StoreError> {
    statuses
        .iter()
        .map(|s| to_bson(s).map_err(bson_err))
        .collect()
}

fn invoice_set(patch: &InvoicePatch, now: DateTime) -> Result<Document, StoreError> {
    let mut set = doc! { "updated_at": now };
    if let Some(status) = patch.status {
        set.insert("status", to_bson(&status).map_err(bson_err)?);
    }
    if let Some(gateway_ref) = &patch.gateway_ref {
        set.insert("gateway_ref", gateway_ref.as_str());
    }
    if let Some(at) = patch.hold_expires_at {
        set.insert("hold_expires_at", at);
    }
    if let Some(at) = patch.paid_at {
        set.insert("paid_at", at);
    }
    if let Some(channel) = patch.paid_channel {
        set.insert("paid_channel", to_bson(&channel).map_err(bson_err)?);
    }
    if let Some(reason) = &patch.refund_reason {
        set.insert("refund_reason", reason.as_str());
    }
    if let Some(refund_ref) = &patch.refund_ref {
        set.insert("refund_ref", refund_ref.as_str());
    }
    if let Some(flag) = patch.needs_review {
        set.insert("needs_review", flag);
    }
    if let Some(reason) = &patch.review_reason {
        set.insert("review_reason", reason.as_str());
    }
    if let Some(synced) = patch.synced {
        set.insert("synced", synced);
    }
    Ok(set)
}

fn appointment_set(patch: &AppointmentPatch, now: DateTime) -> Result<Document, StoreError> {
    let mut set = doc! { "updated_at": now };
    if let Some(status) = patch.status {
        set.insert("status", to_bson(&status).map_err(bson_err)?);
    }
    if let Some(schedule_id) = &patch.schedule_id {
        set.insert("schedule_id", schedule_id.as_str());
    }
    if let Some(proposed) = &patch.proposed_schedule_id {
        set.insert("proposed_schedule_id", to_bson(proposed).map_err(bson_err)?);
    }
    if let Some(at) = patch.reschedule_requested_at {
        set.insert("reschedule_requested_at", to_bson(&at).map_err(bson_err)?);
    }
    if let Some(reason) = &patch.cancel_reason {
        set.insert("cancel_reason", reason.as_str());
    }
    Ok(set)
}

fn return_after() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

#[async_trait]
impl Store for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.invoices
            .insert_one(invoice, None)
            .await
            .map_err(|e| store_err(e, "pending invoice or reference_code"))?;
        Ok(())
    }

    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
        self.invoices
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(backend)
    }

    async fn find_invoice_by_reference(
        &self,
        reference_code: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        self.invoices
            .find_one(doc! { "reference_code": reference_code }, None)
            .await
            .map_err(backend)
    }

    async fn find_invoice_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        self.invoices
            .find_one(doc! { "gateway_ref": gateway_ref }, None)
            .await
            .map_err(backend)
    }

    async fn list_invoices_for_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .build();
        let cursor = self
            .invoices
            .find(doc! { "appointment_id": appointment_id }, options)
            .await
            .map_err(backend)?;
        cursor.try_collect().await.map_err(backend)
    }

    async fn update_invoice_if(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        patch: &InvoicePatch,
        now: DateTime,
    ) -> Result<Option<Invoice>, StoreError> {
        let filter = doc! { "_id": id, "status": { "$in": status_list(expected)? } };
        let update = doc! { "$set": invoice_set(patch, now)? };
        self.invoices
            .find_one_and_update(filter, update, return_after())
            .await
            .map_err(|e| store_err(e, "gateway_ref"))
    }

    async fn find_due_invoices(
        &self,
        invoice_type: InvoiceType,
        now: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError> {
        let filter = doc! {
            "status": "pending",
            "type": invoice_type.as_str(),
            "due_date": { "$lte": now },
        };
        let options = FindOptions::builder()
            .sort(doc! { "due_date": 1 })
            .limit(limit)
            .build();
        let cursor = self.invoices.find(filter, options).await.map_err(backend)?;
        cursor.try_collect().await.map_err(backend)
    }

    async fn find_unsynced_invoices(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<Invoice>, StoreError> {
        let filter = doc! { "synced": false, "updated_at": { "$lte": updated_before } };
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": 1 })
            .limit(limit)
            .build();
        let cursor = self.invoices.find(filter, options).await.map_err(backend)?;
        cursor.try_collect().await.map_err(backend)
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.appointments
            .insert_one(appointment, None)
            .await
            .map_err(|e| store_err(e, "appointment"))?;
        Ok(())
    }

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        self.appointments
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(backend)
    }

    async fn update_appointment_if(
        &self,
        id: &str,
        expected: &[AppointmentStatus],
        patch: &AppointmentPatch,
        now: DateTime,
    ) -> Result<Option<Appointment>, StoreError> {
        let filter = doc! { "_id": id, "status": { "$in": status_list(expected)? } };
        let update = doc! { "$set": appointment_set(patch, now)? };
        self.appointments
            .find_one_and_update(filter, update, return_after())
            .await
            .map_err(backend)
    }

    async fn insert_slot(&self, slot: &ScheduleSlot) -> Result<(), StoreError> {
        self.slots
            .insert_one(slot, None)
            .await
            .map_err(|e| store_err(e, "slot"))?;
        Ok(())
    }

    async fn get_slot(&self, id: &str) -> Result<Option<ScheduleSlot>, StoreError> {
        self.slots
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(backend)
    }

    async fn reserve_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "_id": slot_id,
            "$or": [ { "is_booked": false }, { "held_by": appointment_id } ],
        };
        let update = doc! {
            "$set": { "is_booked": true, "held_by": appointment_id, "updated_at": now },
            "$inc": { "hold_version": 1 },
        };
        let result = self
            .slots
            .update_one(filter, update, None)
            .await
            .map_err(backend)?;
        Ok(result.matched_count == 1)
    }

    async fn release_slot(
        &self,
        slot_id: &str,
        appointment_id: &str,
        hold_version: Option<i64>,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let mut filter = doc! { "_id": slot_id, "held_by": appointment_id };
        if let Some(version) = hold_version {
            filter.insert("hold_version", version);
        }
        let update = doc! {
            "$set": { "is_booked": false, "held_by": null, "updated_at": now }
        };
        let result = self
            .slots
            .update_one(filter, update, None)
            .await
            .map_err(backend)?;
        Ok(result.matched_count == 1)
    }

    async fn find_held_slots(
        &self,
        updated_before: DateTime,
        limit: i64,
    ) -> Result<Vec<ScheduleSlot>, StoreError> {
        let filter = doc! { "is_booked": true, "updated_at": { "$lte": updated_before } };
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": 1 })
            .limit(limit)
            .build();
        let cursor = self.slots.find(filter, options).await.map_err(backend)?;
        cursor.try_collect().await.map_err(backend)
    }

    async fn claim_ledger(
        &self,
        entry: &LedgerEntry,
        stale_before: DateTime,
    ) -> Result<ClaimResult, StoreError> {
        // A held key can be abandoned between our insert and our read; retry
        // a couple of times before giving up.
        for _ in 0..3 {
            match self.ledger.insert_one(entry, None).await {
                Ok(_) => return Ok(ClaimResult::Claimed),
                Err(e) if is_duplicate_key(&e) => {}
                Err(e) => return Err(backend(e)),
            }

            let stale = doc! {
                "_id": entry.key.as_str(),
                "outcome": LedgerOutcome::InProgress.as_str(),
                "claimed_at": { "$lte": stale_before },
            };
            let takeover = doc! { "$set": { "claimed_at": entry.claimed_at } };
            if self
                .ledger
                .find_one_and_update(stale, takeover, return_after())
                .await
                .map_err(backend)?
                .is_some()
            {
                return Ok(ClaimResult::Reclaimed);
            }

            let bump = doc! { "$inc": { "duplicate_count": 1 } };
            if let Some(existing) = self
                .ledger
                .find_one_and_update(doc! { "_id": entry.key.as_str() }, bump, return_after())
                .await
                .map_err(backend)?
            {
                return Ok(ClaimResult::Held(existing));
            }
        }

        Err(StoreError::Backend(anyhow::anyhow!(
            "ledger key {} kept changing hands",
            entry.key
        )))
    }

    async fn seal_ledger(
        &self,
        key: &str,
        claimed_at: DateTime,
        outcome: LedgerOutcome,
        invoice_id: Option<&str>,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "_id": key,
            "outcome": LedgerOutcome::InProgress.as_str(),
            "claimed_at": claimed_at,
        };
        let update = doc! {
            "$set": {
                "outcome": outcome.as_str(),
                "processed_at": now,
                "invoice_id": invoice_id,
            }
        };
        let result = self
            .ledger
            .update_one(filter, update, None)
            .await
            .map_err(backend)?;
        Ok(result.matched_count == 1)
    }

    async fn abandon_ledger(&self, key: &str, claimed_at: DateTime) -> Result<bool, StoreError> {
        let filter = doc! {
            "_id": key,
            "outcome": LedgerOutcome::InProgress.as_str(),
            "claimed_at": claimed_at,
        };
        let result = self
            .ledger
            .delete_one(filter, None)
            .await
            .map_err(backend)?;
        Ok(result.deleted_count == 1)
    }

    async fn get_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>, StoreError> {
        self.ledger
            .find_one(doc! { "_id": key }, None)
            .await
            .map_err(backend)
    }

    async fn find_stale_claims(
        &self,
        stale_before: DateTime,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let filter = doc! {
            "outcome": LedgerOutcome::InProgress.as_str(),
            "claimed_at": { "$lte": stale_before },
        };
        let options = FindOptions::builder().limit(limit).build();
        let cursor = self.ledger.find(filter, options).await.map_err(backend)?;
        cursor.try_collect().await.map_err(backend)
    }
}
