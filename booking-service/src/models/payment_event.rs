use serde::{Deserialize, Serialize};

use super::ledger::ledger_key;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    VnpayReturn,
    PayosWebhook,
    BankTransferManual,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::VnpayReturn => "vnpay_return",
            PaymentChannel::PayosWebhook => "payos_webhook",
            PaymentChannel::BankTransferManual => "bank_transfer_manual",
        }
    }
}

/// A gateway notification normalized by its adapter. Only produced once the
/// channel's trust check (signature, or patient identity for manual
/// transfers) has passed.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub channel: PaymentChannel,
    pub gateway_ref: String,
    /// Our invoice reference code echoed back by the gateway.
    pub reference_code: String,
    pub amount: i64,
    /// Whether the gateway reports the payment as successful.
    pub succeeded: bool,
    pub raw_payload: String,
    pub claimed_signature: Option<String>,
}

impl PaymentEvent {
    pub fn ledger_key(&self) -> String {
        ledger_key(self.channel, &self.gateway_ref)
    }
}
