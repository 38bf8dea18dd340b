//! Refund collaborator. The invoice state machine records refund outcomes;
//! moving money back is done elsewhere.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Invoice, PaymentChannel};

#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub invoice_id: String,
    pub reference_code: String,
    pub gateway_ref: Option<String>,
    pub channel: Option<PaymentChannel>,
    pub amount: i64,
    pub currency: String,
    pub reason: String,
}

impl RefundRequest {
    pub fn for_invoice(invoice: &Invoice, reason: &str) -> Self {
        Self {
            invoice_id: invoice.id.clone(),
            reference_code: invoice.reference_code.clone(),
            gateway_ref: invoice.gateway_ref.clone(),
            channel: invoice.paid_channel,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RefundReceipt {
    pub refund_ref: String,
}

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("refund rejected: {0}")]
    Rejected(String),

    #[error("refund transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RefundGateway: Send + Sync {
    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, RefundError>;
}

pub struct HttpRefundGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRefundGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RefundGateway for HttpRefundGateway {
    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, RefundError> {
        let response = self
            .client
            .traced_post(&self.endpoint)
            .json(request)
            .timeout(Duration::from_secs(10))
            .correlation_id(&request.invoice_id)
            .send()
            .await
            .map_err(|e| RefundError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                invoice_id = %request.invoice_id,
                status = status.as_u16(),
                "Refund endpoint rejected request"
            );
            return Err(RefundError::Rejected(format!("{}: {}", status, body)));
        }

        response
            .json::<RefundReceipt>()
            .await
            .map_err(|e| RefundError::Transport(format!("invalid refund response: {}", e)))
    }
}

/// Records the refund for an operator to execute by hand.
pub struct ManualRefundGateway;

#[async_trait]
impl RefundGateway for ManualRefundGateway {
    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, RefundError> {
        let refund_ref = format!("manual-{}", Uuid::new_v4());
        tracing::warn!(
            invoice_id = %request.invoice_id,
            amount = request.amount,
            refund_ref = %refund_ref,
            reason = %request.reason,
            "Manual refund required"
        );
        Ok(RefundReceipt { refund_ref })
    }
}

#[derive(Default)]
pub struct MockRefundGateway {
    fail: AtomicBool,
    calls: AtomicU64,
}

impl MockRefundGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefundGateway for MockRefundGateway {
    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, RefundError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(RefundError::Transport("mock refund gateway failing".to_string()));
        }
        tracing::info!(invoice_id = %request.invoice_id, "[MOCK] Refund would be issued");
        Ok(RefundReceipt {
            refund_ref: format!("mock-refund-{}", n),
        })
    }
}
