use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

use super::PaymentChannel;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// Claimed by a delivery that has not finished the pipeline yet.
    InProgress,
    Applied,
    Rejected,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::InProgress => "in_progress",
            LedgerOutcome::Applied => "applied",
            LedgerOutcome::Rejected => "rejected",
        }
    }
}

/// One processed (or in-flight) external transaction, keyed by
/// `<channel>:<gateway_ref>`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LedgerEntry {
    #[serde(rename = "_id")]
    pub key: String,
    pub channel: PaymentChannel,
    pub gateway_ref: String,
    pub outcome: LedgerOutcome,
    pub claimed_at: DateTime,
    #[serde(default)]
    pub processed_at: Option<DateTime>,
    #[serde(default)]
    pub invoice_id: Option<String>,
    #[serde(default)]
    pub duplicate_count: i64,
}

impl LedgerEntry {
    pub fn claim(channel: PaymentChannel, gateway_ref: &str, now: DateTime) -> Self {
        Self {
            key: ledger_key(channel, gateway_ref),
            channel,
            gateway_ref: gateway_ref.to_string(),
            outcome: LedgerOutcome::InProgress,
            claimed_at: now,
            processed_at: None,
            invoice_id: None,
            duplicate_count: 0,
        }
    }
}

pub fn ledger_key(channel: PaymentChannel, gateway_ref: &str) -> String {
    format!("{}:{}", channel.as_str(), gateway_ref)
}

/// Result of `admit`: exactly one concurrent caller per key sees `first_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub key: String,
    /// Identifies this caller's claim when sealing or abandoning it.
    pub claimed_at: DateTime,
    pub first_time: bool,
    /// True when the claim was taken over from a stale in-progress marker.
    pub reclaimed: bool,
    /// The entry as it stood when a duplicate was observed.
    pub existing: Option<LedgerEntry>,
}
