//! Gateway callbacks end to end: PayOS webhook and VNPay return.

mod common;

use axum::http::StatusCode;
use booking_service::models::{AppointmentStatus, InvoiceStatus, PaymentChannel};
use booking_service::services::notifier::EventKind;
use common::{
    payos_body, payos_data, payos_envelope, payos_sign, vnpay_query, vnpay_query_minor, TestApp,
};

#[tokio::test]
async fn payos_redelivery_confirms_once() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let body = payos_body(&booked.reference_code, booked.amount, "TXN1");

    let (status, first) = app.payos_webhook(body.clone()).await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    assert_eq!(first["success"], true);
    assert_eq!(first["outcome"], "applied");
    assert_eq!(first["appointment"]["id"], booked.appointment_id.as_str());

    let (status, second) = app.payos_webhook(body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["success"], true);
    assert_eq!(second["outcome"], "duplicate");

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.gateway_ref.as_deref(), Some("TXN1"));
    assert_eq!(invoice.paid_channel, Some(PaymentChannel::PayosWebhook));
    assert!(invoice.synced);

    let appointment = app.appointment(&booked.appointment_id).await;
    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
    assert_eq!(app.notifier.count(EventKind::AppointmentConfirmed), 1);
}

#[tokio::test]
async fn payos_bad_signature_touches_nothing() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let data = payos_data(&booked.reference_code, booked.amount, "TXN1");
    let forged = payos_envelope("00", &data, &"0".repeat(64));

    let (status, body) = app.payos_webhook(forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid signature");

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert!(invoice.gateway_ref.is_none());
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::PendingPayment
    );
    assert_eq!(app.notifier.count(EventKind::AppointmentConfirmed), 0);
}

#[tokio::test]
async fn payos_flipped_amount_is_refused() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let data = payos_data(&booked.reference_code, booked.amount, "TXN1");
    let signature = payos_sign(&data);
    let tampered = data.replace(&format!("\"amount\":{}", booked.amount), "\"amount\":900000");
    assert_ne!(tampered, data);

    let (status, _) = app
        .payos_webhook(payos_envelope("00", &tampered, &signature))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn payos_without_configured_key_fails_closed() {
    let app = TestApp::spawn_with(|config| config.payos.checksum_key = None);
    let booked = app.booked().await;

    let (status, _) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn payos_amount_mismatch_is_acknowledged_and_flagged() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let (status, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount - 1, "TXN1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["message"], "Payment rejected");

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert!(invoice.needs_review);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::PendingPayment
    );
}

#[tokio::test]
async fn payos_malformed_body_is_bad_request() {
    let app = TestApp::spawn();
    let (status, body) = app.payos_webhook("{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    // Parser detail stays in the logs.
    assert_eq!(body["error"], "Malformed payload");
    assert!(body.get("details").is_none());

    let data = r#"{"amount":200000,"reference":"TXN1"}"#;
    let (status, _) = app
        .payos_webhook(payos_envelope("00", data, &payos_sign(data)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn payos_unknown_reference_is_acknowledged() {
    let app = TestApp::spawn();
    let (status, body) = app
        .payos_webhook(payos_body("999999999999", 200_000, "TXN404"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["outcome"], "rejected");
}

#[tokio::test]
async fn payos_declined_payment_leaves_invoice_pending() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let data = payos_data(&booked.reference_code, booked.amount, "TXN1");

    let (status, body) = app
        .payos_webhook(payos_envelope("01", &data, &payos_sign(&data)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "declined");
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);

    // The same transaction can still be paid later.
    let (_, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(body["outcome"], "applied");
}

#[tokio::test]
async fn store_outage_is_retryable() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let body = payos_body(&booked.reference_code, booked.amount, "TXN1");

    app.store.fail_next(1);
    let (status, _) = app.payos_webhook(body.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);

    let (status, retried) = app.payos_webhook(body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["outcome"], "applied");
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::Confirmed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_apply_exactly_once() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let body = payos_body(&booked.reference_code, booked.amount, "TXN1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = app.router();
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method("POST")
                .uri("/webhooks/payos")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body))
                .unwrap();
            let response = router.oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = http_body_util::BodyExt::collect(response.into_body())
                .await
                .unwrap()
                .to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            (status, json["outcome"].as_str().unwrap_or_default().to_string())
        }));
    }

    let mut applied = 0;
    for handle in handles {
        let (status, outcome) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        if outcome == "applied" {
            applied += 1;
        } else {
            assert_eq!(outcome, "duplicate");
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(app.notifier.count(EventKind::AppointmentConfirmed), 1);
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn second_gateway_transaction_for_paid_invoice_is_rejected() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let (_, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(body["outcome"], "applied");

    let (status, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN2"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(
        app.invoice(&booked.invoice_id).await.gateway_ref.as_deref(),
        Some("TXN1")
    );
}

#[tokio::test]
async fn vnpay_return_post_and_redirect_share_the_ledger() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let query = vnpay_query(&booked.reference_code, booked.amount, "14226112", "00");

    let (status, body) = app
        .post_raw(
            "/payments/vnpay/return",
            "text/plain",
            query.clone(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["appointment"]["id"], booked.appointment_id.as_str());

    let (status, body) = app
        .get(&format!("/payments/vnpay/return?{}", query), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.gateway_ref.as_deref(), Some("14226112"));
    assert_eq!(invoice.paid_channel, Some(PaymentChannel::VnpayReturn));
}

#[tokio::test]
async fn vnpay_tampered_query_is_unauthorized() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let query = vnpay_query(&booked.reference_code, booked.amount, "14226112", "00");
    let tampered = query.replace(
        &format!("vnp_Amount={}", booked.amount * 100),
        "vnp_Amount=100",
    );

    let (status, _) = app
        .post_raw("/payments/vnpay/return", "text/plain", tampered)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn vnpay_cancelled_payment_is_declined() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let query = vnpay_query(&booked.reference_code, booked.amount, "0", "24");

    let (status, body) = app
        .post_raw("/payments/vnpay/return", "text/plain", query)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["outcome"], "declined");
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn vnpay_fractional_amount_is_refused() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let query = vnpay_query_minor(&booked.reference_code, booked.amount * 100 + 99, "14226112", "00");

    let (status, body) = app
        .post_raw("/payments/vnpay/return", "text/plain", query)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Malformed payload");
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn empty_vnpay_return_is_bad_request() {
    let app = TestApp::spawn();
    let (status, _) = app
        .post_raw("/payments/vnpay/return", "text/plain", String::new())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
