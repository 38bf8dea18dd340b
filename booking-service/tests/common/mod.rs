#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use booking_service::config::{Config, DatabaseBackend};
use booking_service::models::{Appointment, Invoice, ScheduleSlot};
use booking_service::services::notifier::MockNotifier;
use booking_service::services::refunds::MockRefundGateway;
use booking_service::services::{HashAlgorithm, MemoryStore, SignatureVerifier, Store};
use booking_service::startup::router;
use booking_service::AppState;
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::{json, Value};
use tower::ServiceExt;

pub const PATIENT: &str = "patient-1";
pub const OTHER_PATIENT: &str = "patient-2";
pub const DOCTOR: &str = "doctor-1";
pub const ADMIN: &str = "admin-1";

pub const VNPAY_SECRET: &str = "vnpay-test-secret";
pub const PAYOS_KEY: &str = "payos-test-checksum";

pub const FEE: i64 = 200_000;

/// The service wired against the in-memory store and recording
/// collaborators. Requests go straight through the router, no socket.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MockNotifier>,
    pub refunds: Arc<MockRefundGateway>,
}

/// A patient booking that is waiting for payment.
pub struct Booked {
    pub appointment_id: String,
    pub slot_id: String,
    pub invoice_id: String,
    pub reference_code: String,
    pub amount: i64,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.database.backend = DatabaseBackend::Memory;
    config.vnpay.tmn_code = "TESTTMN1".to_string();
    config.vnpay.hash_secret = Some(Secret::new(VNPAY_SECRET.to_string()));
    config.payos.checksum_key = Some(Secret::new(PAYOS_KEY.to_string()));
    config.bank_transfer.account_no = "0123456789".to_string();
    config.bank_transfer.account_name = "BENH VIEN TEST".to_string();
    config.booking.consultation_fee = FEE;
    config.payments.sync_retry_secs = 1;
    config
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(|_| {})
    }

    pub fn spawn_with(customize: impl FnOnce(&mut Config)) -> Self {
        let mut config = test_config();
        customize(&mut config);

        // Signatures are off, so the nonce store is never contacted.
        let redis = redis::Client::open("redis://127.0.0.1:6379").expect("valid redis url");
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(MockNotifier::new());
        let refunds = Arc::new(MockRefundGateway::new());

        let state = AppState::new(
            config,
            redis,
            store.clone(),
            notifier.clone(),
            refunds.clone(),
        );

        Self {
            state,
            store,
            notifier,
            refunds,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("readable body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str, actor: Option<(&str, &str)>) -> (StatusCode, Value) {
        let request = with_actor(Request::builder().method(Method::GET).uri(uri), actor)
            .body(Body::empty())
            .expect("valid request");
        self.send(request).await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        actor: Option<(&str, &str)>,
        body: Value,
    ) -> (StatusCode, Value) {
        let request = with_actor(Request::builder().method(Method::POST).uri(uri), actor)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("valid request");
        self.send(request).await
    }

    /// POST without a body, for the bare action routes.
    pub async fn post_empty(&self, uri: &str, actor: Option<(&str, &str)>) -> (StatusCode, Value) {
        let request = with_actor(Request::builder().method(Method::POST).uri(uri), actor)
            .body(Body::empty())
            .expect("valid request");
        self.send(request).await
    }

    /// POST the exact bytes given, the way a gateway delivers.
    pub async fn post_raw(&self, uri: &str, content_type: &str, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body))
            .expect("valid request");
        self.send(request).await
    }

    pub async fn payos_webhook(&self, body: String) -> (StatusCode, Value) {
        self.post_raw("/webhooks/payos", "application/json", body)
            .await
    }

    pub async fn create_slot(&self, doctor_id: &str, start: &str, end: &str) -> String {
        let (status, body) = self
            .post_json(
                "/slots",
                Some((doctor_id, "doctor")),
                json!({ "date": "2030-03-04", "start_time": start, "end_time": end }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create slot: {}", body);
        body["id"].as_str().expect("slot id").to_string()
    }

    pub async fn book_slot(&self, patient_id: &str, slot_id: &str) -> (StatusCode, Value) {
        self.post_json(
            "/appointments",
            Some((patient_id, "patient")),
            json!({ "slot_id": slot_id }),
        )
        .await
    }

    /// Publish a slot for `DOCTOR` and book it for `PATIENT`.
    pub async fn booked(&self) -> Booked {
        let slot_id = self.create_slot(DOCTOR, "09:00:00", "09:30:00").await;
        let (status, body) = self.book_slot(PATIENT, &slot_id).await;
        assert_eq!(status, StatusCode::CREATED, "book: {}", body);

        Booked {
            appointment_id: body["appointment"]["id"].as_str().expect("appointment id").to_string(),
            slot_id,
            invoice_id: body["invoice"]["id"].as_str().expect("invoice id").to_string(),
            reference_code: body["invoice"]["reference_code"]
                .as_str()
                .expect("reference code")
                .to_string(),
            amount: body["invoice"]["amount"].as_i64().expect("amount"),
        }
    }

    pub async fn invoice(&self, id: &str) -> Invoice {
        self.store.get_invoice(id).await.unwrap().expect("invoice exists")
    }

    pub async fn appointment(&self, id: &str) -> Appointment {
        self.store
            .get_appointment(id)
            .await
            .unwrap()
            .expect("appointment exists")
    }

    pub async fn slot(&self, id: &str) -> ScheduleSlot {
        self.store.get_slot(id).await.unwrap().expect("slot exists")
    }
}

fn with_actor(
    builder: axum::http::request::Builder,
    actor: Option<(&str, &str)>,
) -> axum::http::request::Builder {
    match actor {
        Some((user_id, role)) => builder
            .header("X-User-ID", user_id)
            .header("X-User-Role", role),
        None => builder,
    }
}

pub fn patient() -> Option<(&'static str, &'static str)> {
    Some((PATIENT, "patient"))
}

pub fn doctor() -> Option<(&'static str, &'static str)> {
    Some((DOCTOR, "doctor"))
}

pub fn admin() -> Option<(&'static str, &'static str)> {
    Some((ADMIN, "admin"))
}

/// The `data` object of a successful PayOS delivery.
pub fn payos_data(reference_code: &str, amount: i64, reference: &str) -> String {
    format!(
        r#"{{"orderCode":{},"amount":{},"description":"TT {}","reference":"{}","paymentLinkId":"pl-{}","code":"00","desc":"success"}}"#,
        reference_code, amount, reference_code, reference, reference_code
    )
}

/// A PayOS webhook body whose signature covers `data` as sent.
pub fn payos_body(reference_code: &str, amount: i64, reference: &str) -> String {
    let data = payos_data(reference_code, amount, reference);
    let signature = payos_sign(&data);
    payos_envelope("00", &data, &signature)
}

pub fn payos_envelope(code: &str, data: &str, signature: &str) -> String {
    format!(
        r#"{{"code":"{}","desc":"success","success":{},"data":{},"signature":"{}"}}"#,
        code,
        code == "00",
        data,
        signature
    )
}

pub fn payos_sign(payload: &str) -> String {
    SignatureVerifier::new(
        HashAlgorithm::Sha256,
        Some(Secret::new(PAYOS_KEY.to_string())),
    )
    .sign(payload)
    .expect("signable")
}

/// A signed VNPay return query for `reference_code`.
pub fn vnpay_query(reference_code: &str, amount: i64, transaction_no: &str, response_code: &str) -> String {
    vnpay_query_minor(reference_code, amount * 100, transaction_no, response_code)
}

/// As `vnpay_query`, with `vnp_Amount` given as sent (hundredths of a dong).
pub fn vnpay_query_minor(
    reference_code: &str,
    vnp_amount: i64,
    transaction_no: &str,
    response_code: &str,
) -> String {
    let params = format!(
        "vnp_Amount={}&vnp_BankCode=NCB&vnp_OrderInfo=Thanh+toan+hoa+don+{}&vnp_ResponseCode={}&vnp_TmnCode=TESTTMN1&vnp_TransactionNo={}&vnp_TransactionStatus={}&vnp_TxnRef={}",
        vnp_amount,
        reference_code,
        response_code,
        transaction_no,
        response_code,
        reference_code
    );
    let mut pairs: Vec<&str> = params.split('&').collect();
    pairs.sort();
    let hash = SignatureVerifier::new(
        HashAlgorithm::Sha512,
        Some(Secret::new(VNPAY_SECRET.to_string())),
    )
    .sign(&pairs.join("&"))
    .expect("signable");
    format!("{}&vnp_SecureHashType=HmacSHA512&vnp_SecureHash={}", params, hash)
}
