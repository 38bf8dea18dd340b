use std::sync::Arc;
use std::time::{Duration, Instant};

use mongodb::bson::DateTime;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PaymentError;
use crate::models::{rfc3339, shift_secs, InvoiceType};
use crate::services::invoices::InvoiceStateMachine;
use crate::services::ledger::IdempotencyLedger;
use crate::services::metrics::record_sweep;
use crate::services::store::Store;
use crate::services::synchronizer::Synchronizer;

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub now: String,
    pub dry_run: bool,
    /// Pending consultation invoices past their due date.
    pub found: u64,
    pub expired: u64,
    /// Paid (or otherwise settled) between the scan and the write.
    pub lost_race: u64,
    pub failed: u64,
    pub resynced: u64,
    /// Slots freed because their holder no longer claims them.
    pub slots_released: u64,
    pub reaped: u64,
}

/// Expires overdue pending invoices and repairs anything a crashed or
/// failed request left half-done. Safe to run concurrently with itself:
/// every write is a compare-and-set.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    invoices: InvoiceStateMachine,
    synchronizer: Synchronizer,
    ledger: IdempotencyLedger,
    batch_size: i64,
    resync_grace_secs: i64,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn Store>,
        invoices: InvoiceStateMachine,
        synchronizer: Synchronizer,
        ledger: IdempotencyLedger,
        batch_size: i64,
        resync_grace_secs: i64,
    ) -> Self {
        Self {
            store,
            invoices,
            synchronizer,
            ledger,
            batch_size,
            resync_grace_secs,
        }
    }

    /// One pass at `now`. Only a failure to list due invoices is an error;
    /// per-invoice failures are counted and left for the next run.
    pub async fn run(&self, now: DateTime, dry_run: bool) -> Result<SweepReport, PaymentError> {
        let started = Instant::now();
        let mut report = SweepReport {
            now: rfc3339(now),
            dry_run,
            ..Default::default()
        };

        let due = self
            .store
            .find_due_invoices(InvoiceType::Consultation, now, self.batch_size)
            .await?;
        report.found = due.len() as u64;

        for invoice in due {
            if dry_run {
                tracing::info!(
                    invoice_id = %invoice.id,
                    appointment_id = %invoice.appointment_id,
                    due_date = %rfc3339(invoice.due_date),
                    transition = "pending -> payment_overdue",
                    "Dry run: would expire invoice and release its slot"
                );
                continue;
            }

            match self.invoices.mark_overdue(&invoice.id, now).await {
                Ok(Some(overdue)) => {
                    match self
                        .synchronizer
                        .sync_invoice_with_retry(&overdue.id, now)
                        .await
                    {
                        Ok(_) => report.expired += 1,
                        Err(e) => {
                            tracing::error!(
                                invoice_id = %overdue.id,
                                error = %e,
                                "Expired invoice but appointment sync failed"
                            );
                            report.failed += 1;
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!(invoice_id = %invoice.id, "Invoice settled before expiry");
                    report.lost_race += 1;
                }
                Err(e) => {
                    tracing::error!(invoice_id = %invoice.id, error = %e, "Failed to expire invoice");
                    report.failed += 1;
                }
            }
        }

        if !dry_run {
            self.resync(now, &mut report).await;
            self.release_orphaned_slots(now, &mut report).await;
            match self.ledger.reap(now, self.batch_size).await {
                Ok(reaped) => report.reaped = reaped.sealed + reaped.released,
                Err(e) => tracing::warn!(error = %e, "Ledger reap failed"),
            }
        }

        record_sweep(report.expired, report.failed);
        metrics::histogram!("sweeper_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            found = report.found,
            expired = report.expired,
            lost_race = report.lost_race,
            failed = report.failed,
            resynced = report.resynced,
            slots_released = report.slots_released,
            reaped = report.reaped,
            dry_run = dry_run,
            duration_ms = started.elapsed().as_millis() as u64,
            "Expiry sweep finished"
        );
        Ok(report)
    }

    async fn resync(&self, now: DateTime, report: &mut SweepReport) {
        let stale = match self
            .store
            .find_unsynced_invoices(shift_secs(now, -self.resync_grace_secs), self.batch_size)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list unsynced invoices");
                return;
            }
        };

        for invoice in stale {
            match self.synchronizer.sync_invoice(&invoice, now).await {
                Ok(outcome) => {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        status = invoice.status.as_str(),
                        outcome = outcome.as_str(),
                        "Re-synchronized invoice"
                    );
                    report.resynced += 1;
                }
                Err(e) => {
                    tracing::warn!(invoice_id = %invoice.id, error = %e, "Re-sync failed");
                    report.failed += 1;
                }
            }
        }
    }

    /// Free slots still booked by an appointment that was cancelled or moved
    /// elsewhere after its own release failed. Recent holds are skipped so a
    /// booking or reschedule that has reserved but not yet written its
    /// appointment is left alone; the release is pinned to the hold version
    /// read here.
    async fn release_orphaned_slots(&self, now: DateTime, report: &mut SweepReport) {
        let held = match self
            .store
            .find_held_slots(shift_secs(now, -self.resync_grace_secs), self.batch_size)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list held slots");
                return;
            }
        };

        for slot in held {
            let Some(holder) = slot.held_by.as_deref() else {
                continue;
            };
            let claimed = match self.store.get_appointment(holder).await {
                Ok(appointment) => appointment.is_some_and(|a| a.claims_slot(&slot.id)),
                Err(e) => {
                    tracing::warn!(slot_id = %slot.id, error = %e, "Could not load slot holder");
                    report.failed += 1;
                    continue;
                }
            };
            if claimed {
                continue;
            }

            match self
                .store
                .release_slot(&slot.id, holder, Some(slot.hold_version), now)
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        slot_id = %slot.id,
                        appointment_id = %holder,
                        "Released slot no longer claimed by its holder"
                    );
                    report.slots_released += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(slot_id = %slot.id, error = %e, "Orphaned slot release failed");
                    report.failed += 1;
                }
            }
        }
    }

    /// Run every `interval` until `shutdown` fires.
    pub fn spawn_periodic(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "Expiry sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Expiry sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run(DateTime::now(), false).await {
                            tracing::error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }
        })
    }
}
