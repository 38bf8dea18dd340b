//! Shared path for every payment channel once its adapter has produced a
//! trusted `PaymentEvent`: ledger claim, invoice transition, appointment sync.

use mongodb::bson::DateTime;

use crate::error::PaymentError;
use crate::models::{Invoice, LedgerOutcome, PaymentEvent};
use crate::services::invoices::{InvoiceStateMachine, MarkPaidOutcome};
use crate::services::ledger::IdempotencyLedger;
use crate::services::metrics::record_payment_event;
use crate::services::store::Store;
use crate::services::synchronizer::{SyncOutcome, Synchronizer};
use std::sync::Arc;

/// How a delivery was resolved. Every variant is acknowledged to the
/// gateway; only errors (signature, transient store) are not.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// The payment was applied by this delivery.
    Applied {
        invoice: Invoice,
        sync: Option<SyncOutcome>,
    },
    /// Another delivery of the same transaction got there first.
    Duplicate { invoice: Invoice },
    /// Business rejection: nothing changed except review flags.
    Rejected {
        reason: &'static str,
        invoice: Option<Invoice>,
    },
    /// The gateway reported a failed or abandoned payment.
    Declined { invoice: Option<Invoice> },
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Applied { .. } => "applied",
            PipelineOutcome::Duplicate { .. } => "duplicate",
            PipelineOutcome::Rejected { .. } => "rejected",
            PipelineOutcome::Declined { .. } => "declined",
        }
    }

    pub fn invoice(&self) -> Option<&Invoice> {
        match self {
            PipelineOutcome::Applied { invoice, .. } | PipelineOutcome::Duplicate { invoice } => {
                Some(invoice)
            }
            PipelineOutcome::Rejected { invoice, .. } | PipelineOutcome::Declined { invoice } => {
                invoice.as_ref()
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Applied { .. } | PipelineOutcome::Duplicate { .. }
        )
    }
}

#[derive(Clone)]
pub struct PaymentPipeline {
    store: Arc<dyn Store>,
    ledger: IdempotencyLedger,
    invoices: InvoiceStateMachine,
    synchronizer: Synchronizer,
}

impl PaymentPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: IdempotencyLedger,
        invoices: InvoiceStateMachine,
        synchronizer: Synchronizer,
    ) -> Self {
        Self {
            store,
            ledger,
            invoices,
            synchronizer,
        }
    }

    pub async fn process(
        &self,
        event: &PaymentEvent,
        now: DateTime,
    ) -> Result<PipelineOutcome, PaymentError> {
        let result = self.run(event, now).await;
        let label = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(e) => e.kind(),
        };
        record_payment_event(event.channel.as_str(), label);
        result
    }

    async fn run(
        &self,
        event: &PaymentEvent,
        now: DateTime,
    ) -> Result<PipelineOutcome, PaymentError> {
        let invoice = self
            .store
            .find_invoice_by_reference(&event.reference_code)
            .await?;

        if !event.succeeded {
            tracing::info!(
                gateway_ref = %event.gateway_ref,
                reference_code = %event.reference_code,
                channel = event.channel.as_str(),
                "Gateway reported unsuccessful payment"
            );
            return Ok(PipelineOutcome::Declined { invoice });
        }

        let Some(invoice) = invoice else {
            tracing::warn!(
                gateway_ref = %event.gateway_ref,
                reference_code = %event.reference_code,
                channel = event.channel.as_str(),
                "Payment for unknown reference code"
            );
            return Ok(PipelineOutcome::Rejected {
                reason: "unknown_reference",
                invoice: None,
            });
        };

        let admission = self
            .ledger
            .admit(event.channel, &event.gateway_ref, now)
            .await?;
        if !admission.first_time {
            return Ok(PipelineOutcome::Duplicate { invoice });
        }

        let marked = self
            .invoices
            .mark_paid(
                &invoice.id,
                &event.gateway_ref,
                event.amount,
                event.channel,
                now,
            )
            .await;

        let paid = match marked {
            Ok(MarkPaidOutcome::Applied(paid)) | Ok(MarkPaidOutcome::AlreadyApplied(paid)) => paid,
            Err(e) if e.is_transient() => {
                // Let the gateway's retry run the whole pipeline again.
                if let Err(abandon_err) = self.ledger.abandon(&admission).await {
                    tracing::warn!(
                        key = %admission.key,
                        error = %abandon_err,
                        "Could not abandon ledger claim; reaper will release it"
                    );
                }
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    gateway_ref = %event.gateway_ref,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Payment rejected"
                );
                self.seal(&admission, LedgerOutcome::Rejected, &invoice.id, now)
                    .await;
                let current = self.store.get_invoice(&invoice.id).await.ok().flatten();
                return Ok(PipelineOutcome::Rejected {
                    reason: e.kind(),
                    invoice: current.or(Some(invoice)),
                });
            }
        };

        // The payment has landed; from here on failures are repaired by the
        // sweeper's resync pass rather than by gateway retries.
        let sync = match self
            .synchronizer
            .sync_invoice_with_retry(&paid.id, now)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    invoice_id = %paid.id,
                    appointment_id = %paid.appointment_id,
                    error = %e,
                    "Appointment sync failed; left for the sweeper"
                );
                None
            }
        };

        self.seal(&admission, LedgerOutcome::Applied, &paid.id, now)
            .await;

        tracing::info!(
            gateway_ref = %event.gateway_ref,
            invoice_id = %paid.id,
            appointment_id = %paid.appointment_id,
            channel = event.channel.as_str(),
            sync = sync.map(|s| s.as_str()).unwrap_or("deferred"),
            "Payment applied"
        );

        let invoice = self
            .store
            .get_invoice(&paid.id)
            .await
            .ok()
            .flatten()
            .unwrap_or(paid);
        Ok(PipelineOutcome::Applied { invoice, sync })
    }

    async fn seal(
        &self,
        admission: &crate::models::Admission,
        outcome: LedgerOutcome,
        invoice_id: &str,
        now: DateTime,
    ) {
        if let Err(e) = self
            .ledger
            .complete(admission, outcome, Some(invoice_id), now)
            .await
        {
            // Left in progress; the reaper seals or releases it.
            tracing::warn!(key = %admission.key, error = %e, "Failed to seal ledger claim");
        }
    }
}
