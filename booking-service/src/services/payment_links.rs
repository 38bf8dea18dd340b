use mongodb::bson::DateTime;
use serde::Serialize;

use crate::config::{BankTransferConfig, VnpayConfig};
use crate::error::PaymentError;
use crate::models::{shift_secs, Invoice, InvoiceStatus};
use crate::services::signature::{HashAlgorithm, SignatureVerifier};

const VNPAY_VERSION: &str = "2.1.0";
/// VNPay timestamps are wall-clock Vietnam time (GMT+7).
const VNPAY_UTC_OFFSET_SECS: i64 = 7 * 3600;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferInstructions {
    pub invoice_id: String,
    pub bank_id: String,
    pub account_no: String,
    pub account_name: String,
    pub amount: i64,
    pub currency: String,
    /// Transfer memo the patient must use; matched against the invoice.
    pub memo: String,
    pub qr_image_url: String,
}

/// Builds the links a patient follows to pay an invoice.
#[derive(Clone)]
pub struct PaymentLinkService {
    vnpay: VnpayConfig,
    bank: BankTransferConfig,
    signer: SignatureVerifier,
}

impl PaymentLinkService {
    pub fn new(vnpay: VnpayConfig, bank: BankTransferConfig) -> Self {
        let signer = SignatureVerifier::new(HashAlgorithm::Sha512, vnpay.hash_secret.clone());
        Self {
            vnpay,
            bank,
            signer,
        }
    }

    /// Signed VNPay redirect URL for `invoice`.
    pub fn vnpay_url(
        &self,
        invoice: &Invoice,
        client_ip: &str,
        now: DateTime,
    ) -> Result<String, PaymentError> {
        ensure_payable(invoice)?;
        if self.vnpay.tmn_code.is_empty() || !self.signer.is_configured() {
            return Err(PaymentError::Misconfigured(
                "VNPay merchant code or hash secret missing".to_string(),
            ));
        }

        let expires = if invoice.due_date > now {
            invoice.due_date
        } else {
            shift_secs(now, 15 * 60)
        };

        let mut params: Vec<(&str, String)> = vec![
            ("vnp_Amount", (invoice.amount * 100).to_string()),
            ("vnp_Command", "pay".to_string()),
            ("vnp_CreateDate", vnpay_timestamp(now)),
            ("vnp_CurrCode", invoice.currency.clone()),
            ("vnp_ExpireDate", vnpay_timestamp(expires)),
            ("vnp_IpAddr", client_ip.to_string()),
            ("vnp_Locale", self.vnpay.locale.clone()),
            (
                "vnp_OrderInfo",
                format!("Thanh toan hoa don {}", invoice.reference_code),
            ),
            ("vnp_OrderType", "other".to_string()),
            ("vnp_ReturnUrl", self.vnpay.return_url.clone()),
            ("vnp_TmnCode", self.vnpay.tmn_code.clone()),
            ("vnp_TxnRef", invoice.reference_code.clone()),
            ("vnp_Version", VNPAY_VERSION.to_string()),
        ];
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, form_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let hash = self
            .signer
            .sign(&query)
            .map_err(|e| PaymentError::Misconfigured(e.to_string()))?;

        Ok(format!(
            "{}?{}&vnp_SecureHash={}",
            self.vnpay.pay_url, query, hash
        ))
    }

    /// Receiving account and a VietQR quick-link image for a manual transfer.
    pub fn transfer_instructions(
        &self,
        invoice: &Invoice,
    ) -> Result<TransferInstructions, PaymentError> {
        ensure_payable(invoice)?;
        if self.bank.account_no.is_empty() {
            return Err(PaymentError::Misconfigured(
                "bank transfer account is not configured".to_string(),
            ));
        }

        let qr_image_url = format!(
            "https://img.vietqr.io/image/{}-{}-compact.png?amount={}&addInfo={}&accountName={}",
            urlencoding::encode(&self.bank.bank_id),
            urlencoding::encode(&self.bank.account_no),
            invoice.amount,
            urlencoding::encode(&invoice.reference_code),
            urlencoding::encode(&self.bank.account_name)
        );

        Ok(TransferInstructions {
            invoice_id: invoice.id.clone(),
            bank_id: self.bank.bank_id.clone(),
            account_no: self.bank.account_no.clone(),
            account_name: self.bank.account_name.clone(),
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            memo: invoice.reference_code.clone(),
            qr_image_url,
        })
    }
}

fn ensure_payable(invoice: &Invoice) -> Result<(), PaymentError> {
    if InvoiceStatus::PAYABLE.contains(&invoice.status) {
        Ok(())
    } else {
        Err(PaymentError::AlreadyTerminal {
            invoice_id: invoice.id.clone(),
            status: invoice.status,
        })
    }
}

/// Percent-encoding with spaces as `+`, which is what VNPay signs.
fn form_encode(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

fn vnpay_timestamp(at: DateTime) -> String {
    (at.to_chrono() + chrono::Duration::seconds(VNPAY_UTC_OFFSET_SECS))
        .naive_utc()
        .format("%Y%m%d%H%M%S")
        .to_string()
}
