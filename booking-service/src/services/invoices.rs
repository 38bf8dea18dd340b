//! Invoice lifecycle.
//!
//! Every transition is a compare-and-set on `status`, so concurrent writers
//! settle deterministically: a payment landing while the sweeper expires the
//! same invoice always ends `paid`, because the overdue write only matches
//! `pending` and `paid` accepts `payment_overdue` as a source.

use std::sync::Arc;

use mongodb::bson::DateTime;

use crate::error::PaymentError;
use crate::models::{Invoice, InvoicePatch, InvoiceStatus, InvoiceType, PaymentChannel};
use crate::services::metrics::record_invoice_transition;
use crate::services::refunds::{RefundGateway, RefundRequest};
use crate::services::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum MarkPaidOutcome {
    Applied(Invoice),
    /// The invoice was already paid by this very gateway transaction.
    AlreadyApplied(Invoice),
}

impl MarkPaidOutcome {
    pub fn invoice(&self) -> &Invoice {
        match self {
            MarkPaidOutcome::Applied(invoice) | MarkPaidOutcome::AlreadyApplied(invoice) => invoice,
        }
    }
}

#[derive(Clone)]
pub struct InvoiceStateMachine {
    store: Arc<dyn Store>,
    amount_tolerance: i64,
}

impl InvoiceStateMachine {
    pub fn new(store: Arc<dyn Store>, amount_tolerance: i64) -> Self {
        Self {
            store,
            amount_tolerance,
        }
    }

    async fn load(&self, invoice_id: &str) -> Result<Invoice, PaymentError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("invoice {}", invoice_id)))
    }

    /// Create a pending invoice for an appointment that reached a billable stage.
    pub async fn issue(
        &self,
        appointment_id: &str,
        invoice_type: InvoiceType,
        amount: i64,
        currency: &str,
        due_date: DateTime,
        now: DateTime,
    ) -> Result<Invoice, PaymentError> {
        let invoice = Invoice::new(appointment_id, invoice_type, amount, currency, due_date, now);

        match self.store.insert_invoice(&invoice).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(PaymentError::Conflict(format!(
                    "appointment {} already has a pending {} invoice",
                    appointment_id,
                    invoice_type.as_str()
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            invoice_id = %invoice.id,
            appointment_id = %appointment_id,
            invoice_type = invoice_type.as_str(),
            amount = amount,
            reference_code = %invoice.reference_code,
            "Invoice issued"
        );
        record_invoice_transition(InvoiceStatus::Pending.as_str());
        Ok(invoice)
    }

    pub async fn mark_paid(
        &self,
        invoice_id: &str,
        gateway_ref: &str,
        amount: i64,
        channel: PaymentChannel,
        now: DateTime,
    ) -> Result<MarkPaidOutcome, PaymentError> {
        let invoice = self.load(invoice_id).await?;

        if let Some(outcome) = settled_by(&invoice, gateway_ref)? {
            return Ok(outcome);
        }

        let tolerance = self.amount_tolerance.max(0) as u64;
        if amount.abs_diff(invoice.amount) > tolerance {
            tracing::warn!(
                invoice_id = %invoice.id,
                gateway_ref = %gateway_ref,
                expected = invoice.amount,
                received = amount,
                "Payment amount mismatch; flagging invoice for review"
            );
            self.flag_for_review(
                &invoice.id,
                &format!(
                    "amount mismatch on {}: expected {}, received {}",
                    gateway_ref, invoice.amount, amount
                ),
                now,
            )
            .await?;
            return Err(PaymentError::AmountMismatch {
                expected: invoice.amount,
                received: amount,
            });
        }

        let patch = InvoicePatch {
            status: Some(InvoiceStatus::Paid),
            gateway_ref: Some(gateway_ref.to_string()),
            paid_at: Some(now),
            paid_channel: Some(channel),
            synced: Some(false),
            ..Default::default()
        };

        let updated = match self
            .store
            .update_invoice_if(&invoice.id, &InvoiceStatus::PAYABLE, &patch, now)
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::Duplicate(_)) => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    gateway_ref = %gateway_ref,
                    "Gateway reference already credited to another invoice"
                );
                return Err(PaymentError::Conflict(format!(
                    "gateway reference {} already credited",
                    gateway_ref
                )));
            }
            Err(e) => return Err(e.into()),
        };

        match updated {
            Some(paid) => {
                tracing::info!(
                    invoice_id = %paid.id,
                    gateway_ref = %gateway_ref,
                    channel = channel.as_str(),
                    from = invoice.status.as_str(),
                    "Invoice paid"
                );
                record_invoice_transition(InvoiceStatus::Paid.as_str());
                Ok(MarkPaidOutcome::Applied(paid))
            }
            None => {
                // Lost a race; report against whatever won.
                let current = self.load(invoice_id).await?;
                settled_by(&current, gateway_ref)?.ok_or_else(|| PaymentError::AlreadyTerminal {
                    invoice_id: current.id.clone(),
                    status: current.status,
                })
            }
        }
    }

    /// Expire a pending invoice. Returns `None` when there was nothing to do:
    /// the invoice is no longer pending, or a payment won the race.
    pub async fn mark_overdue(
        &self,
        invoice_id: &str,
        now: DateTime,
    ) -> Result<Option<Invoice>, PaymentError> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status != InvoiceStatus::Pending {
            return Ok(None);
        }

        let patch = InvoicePatch {
            status: Some(InvoiceStatus::PaymentOverdue),
            hold_expires_at: Some(invoice.due_date),
            synced: Some(false),
            ..Default::default()
        };
        let updated = self
            .store
            .update_invoice_if(&invoice.id, &[InvoiceStatus::Pending], &patch, now)
            .await?;

        if let Some(overdue) = &updated {
            tracing::info!(
                invoice_id = %overdue.id,
                appointment_id = %overdue.appointment_id,
                "Invoice payment overdue"
            );
            record_invoice_transition(InvoiceStatus::PaymentOverdue.as_str());
        }
        Ok(updated)
    }

    /// Refund a paid invoice through `gateway` and record the outcome.
    pub async fn refund(
        &self,
        invoice_id: &str,
        reason: &str,
        gateway: &dyn RefundGateway,
        now: DateTime,
    ) -> Result<Invoice, PaymentError> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status != InvoiceStatus::Paid {
            return Err(PaymentError::InvalidTransition(format!(
                "cannot refund invoice {} in status {}",
                invoice.id, invoice.status
            )));
        }

        let receipt = match gateway
            .refund(&RefundRequest::for_invoice(&invoice, reason))
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::error!(invoice_id = %invoice.id, error = %e, "Refund failed");
                self.flag_for_review(&invoice.id, &format!("refund failed: {}", e), now)
                    .await?;
                return Err(PaymentError::RefundFailed(e.to_string()));
            }
        };

        let patch = InvoicePatch {
            status: Some(InvoiceStatus::Refunded),
            refund_reason: Some(reason.to_string()),
            refund_ref: Some(receipt.refund_ref.clone()),
            synced: Some(false),
            ..Default::default()
        };
        match self
            .store
            .update_invoice_if(&invoice.id, &[InvoiceStatus::Paid], &patch, now)
            .await?
        {
            Some(refunded) => {
                tracing::info!(
                    invoice_id = %refunded.id,
                    refund_ref = %receipt.refund_ref,
                    reason = %reason,
                    "Invoice refunded"
                );
                record_invoice_transition(InvoiceStatus::Refunded.as_str());
                Ok(refunded)
            }
            None => {
                let current = self.load(invoice_id).await?;
                Err(PaymentError::AlreadyTerminal {
                    invoice_id: current.id,
                    status: current.status,
                })
            }
        }
    }

    /// Cancel an unpaid invoice; `None` if it had already settled.
    pub async fn cancel(
        &self,
        invoice_id: &str,
        now: DateTime,
    ) -> Result<Option<Invoice>, PaymentError> {
        let patch = InvoicePatch {
            status: Some(InvoiceStatus::Cancelled),
            synced: Some(false),
            ..Default::default()
        };
        let updated = self
            .store
            .update_invoice_if(invoice_id, &InvoiceStatus::PAYABLE, &patch, now)
            .await?;
        if updated.is_some() {
            tracing::info!(invoice_id = %invoice_id, "Invoice cancelled");
            record_invoice_transition(InvoiceStatus::Cancelled.as_str());
        }
        Ok(updated)
    }

    pub async fn flag_for_review(
        &self,
        invoice_id: &str,
        reason: &str,
        now: DateTime,
    ) -> Result<(), PaymentError> {
        let patch = InvoicePatch {
            needs_review: Some(true),
            review_reason: Some(reason.to_string()),
            ..Default::default()
        };
        self.store
            .update_invoice_if(invoice_id, &InvoiceStatus::ALL, &patch, now)
            .await?;
        Ok(())
    }

    /// Clear the outbox flag, unless the invoice moved on since `invoice`
    /// was read.
    pub async fn mark_synced(&self, invoice: &Invoice, now: DateTime) -> Result<bool, PaymentError> {
        let patch = InvoicePatch {
            synced: Some(true),
            ..Default::default()
        };
        Ok(self
            .store
            .update_invoice_if(&invoice.id, &[invoice.status], &patch, now)
            .await?
            .is_some())
    }
}

/// `Some` when the invoice can no longer take this payment: either already
/// applied by the same transaction, or an error describing why not.
fn settled_by(invoice: &Invoice, gateway_ref: &str) -> Result<Option<MarkPaidOutcome>, PaymentError> {
    if invoice.status == InvoiceStatus::Paid && invoice.gateway_ref.as_deref() == Some(gateway_ref) {
        return Ok(Some(MarkPaidOutcome::AlreadyApplied(invoice.clone())));
    }
    if !InvoiceStatus::PAYABLE.contains(&invoice.status) {
        return Err(PaymentError::AlreadyTerminal {
            invoice_id: invoice.id.clone(),
            status: invoice.status,
        });
    }
    Ok(None)
}
