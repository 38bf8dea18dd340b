use secrecy::Secret;
use serde::Deserialize;
use service_core::error::AppError;

/// Service configuration, layered from an optional `configuration` file and
/// `BOOKING__SECTION__KEY` environment variables.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub signature: ServiceSignatureConfig,
    pub vnpay: VnpayConfig,
    pub payos: PayosConfig,
    pub bank_transfer: BankTransferConfig,
    pub payments: PaymentsConfig,
    pub ledger: LedgerConfig,
    pub booking: BookingConfig,
    pub sweeper: SweeperConfig,
    pub notifications: NotificationsConfig,
    pub refunds: RefundsConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        service_core::config::load("BOOKING")
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3010,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Mongo,
    Memory,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Secret<String>,
    pub db_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Mongo,
            url: Secret::new("mongodb://localhost:27017".to_string()),
            db_name: "booking_db".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Secret::new("redis://localhost:6379".to_string()),
        }
    }
}

/// BFF request signing.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServiceSignatureConfig {
    pub enabled: bool,
    pub secret: Secret<String>,
    pub expiry_seconds: u64,
    pub max_skew_secs: i64,
}

impl Default for ServiceSignatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: Secret::new("dev-secret".to_string()),
            expiry_seconds: 300,
            max_skew_secs: 60,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct VnpayConfig {
    pub tmn_code: String,
    pub hash_secret: Option<Secret<String>>,
    pub pay_url: String,
    pub return_url: String,
    pub locale: String,
}

impl Default for VnpayConfig {
    fn default() -> Self {
        Self {
            tmn_code: String::new(),
            hash_secret: None,
            pay_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string(),
            return_url: "http://localhost:3000/payment/vnpay-return".to_string(),
            locale: "vn".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PayosConfig {
    pub checksum_key: Option<Secret<String>>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BankTransferConfig {
    /// VietQR bank identifier (BIN or short name).
    pub bank_id: String,
    pub account_no: String,
    pub account_name: String,
}

impl Default for BankTransferConfig {
    fn default() -> Self {
        Self {
            bank_id: "970422".to_string(),
            account_no: String::new(),
            account_name: String::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PaymentsConfig {
    /// Largest accepted absolute difference between paid and invoiced amount.
    pub amount_tolerance: i64,
    pub currency: String,
    pub invoice_due_minutes: i64,
    /// Budget for retrying appointment/slot synchronization inline.
    pub sync_retry_secs: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: 0,
            currency: "VND".to_string(),
            invoice_due_minutes: 15,
            sync_retry_secs: 5,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LedgerConfig {
    pub claim_ttl_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: 120,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BookingConfig {
    pub require_doctor_approval: bool,
    /// Seconds after which a doctor may accept their own reschedule proposal.
    /// `None` disables self-accept.
    pub reschedule_auto_accept_secs: Option<i64>,
    pub consultation_fee: i64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            require_doctor_approval: false,
            reschedule_auto_accept_secs: Some(86_400),
            consultation_fee: 200_000,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: i64,
    /// How long an unsynced invoice or a held slot is left alone before the
    /// sweeper repairs it.
    pub resync_grace_secs: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            batch_size: 100,
            resync_grace_secs: 30,
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Notification hub endpoint; events are only logged when unset.
    pub endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RefundsConfig {
    /// Refund endpoint; refunds are recorded as manual when unset.
    pub endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "booking-service".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
        }
    }
}
