use std::sync::Arc;

use mongodb::bson::DateTime;

use crate::models::{shift_secs, Admission, InvoiceStatus, LedgerEntry, LedgerOutcome, PaymentChannel};
use crate::services::store::{ClaimResult, Store, StoreError};

/// Result of one reaper pass over stale in-progress claims.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Claims whose payment had landed; sealed as applied.
    pub sealed: u64,
    /// Claims with no resulting payment; deleted so a retry may run.
    pub released: u64,
}

/// Records which gateway transactions have already produced an effect.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn Store>,
    claim_ttl_secs: i64,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn Store>, claim_ttl_secs: i64) -> Self {
        Self {
            store,
            claim_ttl_secs,
        }
    }

    fn stale_before(&self, now: DateTime) -> DateTime {
        shift_secs(now, -self.claim_ttl_secs)
    }

    /// Atomically claim `<channel>:<gateway_ref>`.
    pub async fn admit(
        &self,
        channel: PaymentChannel,
        gateway_ref: &str,
        now: DateTime,
    ) -> Result<Admission, StoreError> {
        let entry = LedgerEntry::claim(channel, gateway_ref, now);
        let result = self
            .store
            .claim_ledger(&entry, self.stale_before(now))
            .await?;

        let admission = match result {
            ClaimResult::Claimed => Admission {
                key: entry.key,
                claimed_at: now,
                first_time: true,
                reclaimed: false,
                existing: None,
            },
            ClaimResult::Reclaimed => {
                tracing::warn!(key = %entry.key, "Reclaimed stale in-progress ledger claim");
                Admission {
                    key: entry.key,
                    claimed_at: now,
                    first_time: true,
                    reclaimed: true,
                    existing: None,
                }
            }
            ClaimResult::Held(existing) => {
                tracing::info!(
                    key = %entry.key,
                    outcome = existing.outcome.as_str(),
                    duplicate_count = existing.duplicate_count,
                    "Duplicate payment delivery"
                );
                Admission {
                    key: entry.key,
                    claimed_at: existing.claimed_at,
                    first_time: false,
                    reclaimed: false,
                    existing: Some(existing),
                }
            }
        };

        Ok(admission)
    }

    /// Seal a first-time claim with its terminal outcome.
    pub async fn complete(
        &self,
        admission: &Admission,
        outcome: LedgerOutcome,
        invoice_id: Option<&str>,
        now: DateTime,
    ) -> Result<bool, StoreError> {
        let sealed = self
            .store
            .seal_ledger(&admission.key, admission.claimed_at, outcome, invoice_id, now)
            .await?;
        if !sealed {
            tracing::warn!(key = %admission.key, "Ledger claim was taken over before sealing");
        }
        Ok(sealed)
    }

    /// Drop a first-time claim after a transient failure so a retried
    /// delivery runs the whole pipeline again.
    pub async fn abandon(&self, admission: &Admission) -> Result<bool, StoreError> {
        self.store
            .abandon_ledger(&admission.key, admission.claimed_at)
            .await
    }

    /// Roll back or seal claims stuck in progress beyond the TTL.
    pub async fn reap(&self, now: DateTime, limit: i64) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();
        let stale = self
            .store
            .find_stale_claims(self.stale_before(now), limit)
            .await?;

        for entry in stale {
            let landed = self
                .store
                .find_invoice_by_gateway_ref(&entry.gateway_ref)
                .await?
                .filter(|invoice| {
                    matches!(invoice.status, InvoiceStatus::Paid | InvoiceStatus::Refunded)
                });

            match landed {
                Some(invoice) => {
                    if self
                        .store
                        .seal_ledger(
                            &entry.key,
                            entry.claimed_at,
                            LedgerOutcome::Applied,
                            Some(&invoice.id),
                            now,
                        )
                        .await?
                    {
                        report.sealed += 1;
                    }
                }
                None => {
                    if self.store.abandon_ledger(&entry.key, entry.claimed_at).await? {
                        report.released += 1;
                    }
                }
            }
        }

        if report.sealed + report.released > 0 {
            tracing::info!(
                sealed = report.sealed,
                released = report.released,
                "Reaped stale ledger claims"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Invoice, InvoicePatch, InvoiceType};
    use crate::services::store::MemoryStore;

    fn ledger() -> (Arc<MemoryStore>, IdempotencyLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = IdempotencyLedger::new(store.clone(), 120);
        (store, ledger)
    }

    #[tokio::test]
    async fn second_admission_is_a_duplicate() {
        let (_, ledger) = ledger();
        let now = DateTime::now();

        let first = ledger.admit(PaymentChannel::PayosWebhook, "TXN1", now).await.unwrap();
        let second = ledger.admit(PaymentChannel::PayosWebhook, "TXN1", now).await.unwrap();

        assert!(first.first_time);
        assert!(!second.first_time);
        assert_eq!(second.existing.unwrap().duplicate_count, 1);
    }

    #[tokio::test]
    async fn channels_do_not_share_keys() {
        let (_, ledger) = ledger();
        let now = DateTime::now();

        let payos = ledger.admit(PaymentChannel::PayosWebhook, "TXN1", now).await.unwrap();
        let vnpay = ledger.admit(PaymentChannel::VnpayReturn, "TXN1", now).await.unwrap();
        assert!(payos.first_time && vnpay.first_time);
    }

    #[tokio::test]
    async fn abandoned_claim_can_be_retried() {
        let (_, ledger) = ledger();
        let now = DateTime::now();

        let first = ledger.admit(PaymentChannel::PayosWebhook, "TXN1", now).await.unwrap();
        assert!(ledger.abandon(&first).await.unwrap());

        let retry = ledger.admit(PaymentChannel::PayosWebhook, "TXN1", now).await.unwrap();
        assert!(retry.first_time);
        assert!(!retry.reclaimed);
    }

    #[tokio::test]
    async fn stuck_claim_is_reclaimed_after_ttl() {
        let (_, ledger) = ledger();
        let then = DateTime::now();

        ledger.admit(PaymentChannel::PayosWebhook, "TXN1", then).await.unwrap();
        let early = ledger
            .admit(PaymentChannel::PayosWebhook, "TXN1", shift_secs(then, 60))
            .await
            .unwrap();
        assert!(!early.first_time);

        let late = ledger
            .admit(PaymentChannel::PayosWebhook, "TXN1", shift_secs(then, 121))
            .await
            .unwrap();
        assert!(late.first_time);
        assert!(late.reclaimed);
    }

    #[tokio::test]
    async fn reap_seals_landed_payments_and_releases_the_rest() {
        let (store, ledger) = ledger();
        let then = DateTime::now();

        let invoice = Invoice::new("appt-1", InvoiceType::Consultation, 10, "VND", then, then);
        store.insert_invoice(&invoice).await.unwrap();
        let paid = InvoicePatch {
            status: Some(InvoiceStatus::Paid),
            gateway_ref: Some("TXN1".to_string()),
            ..Default::default()
        };
        store
            .update_invoice_if(&invoice.id, &InvoiceStatus::PAYABLE, &paid, then)
            .await
            .unwrap();

        ledger.admit(PaymentChannel::PayosWebhook, "TXN1", then).await.unwrap();
        ledger.admit(PaymentChannel::PayosWebhook, "TXN2", then).await.unwrap();

        let report = ledger.reap(shift_secs(then, 600), 100).await.unwrap();
        assert_eq!(report, ReapReport { sealed: 1, released: 1 });

        let sealed = store.get_ledger_entry("payos_webhook:TXN1").await.unwrap().unwrap();
        assert_eq!(sealed.outcome, LedgerOutcome::Applied);
        assert_eq!(sealed.invoice_id.as_deref(), Some(invoice.id.as_str()));
        assert!(store.get_ledger_entry("payos_webhook:TXN2").await.unwrap().is_none());
    }
}
