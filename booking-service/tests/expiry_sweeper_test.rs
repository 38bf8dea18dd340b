mod common;

use axum::http::StatusCode;
use booking_service::models::{shift_secs, AppointmentStatus, InvoiceStatus};
use booking_service::services::notifier::EventKind;
use common::{payos_body, TestApp, OTHER_PATIENT};
use mongodb::bson::DateTime;

fn an_hour_later() -> DateTime {
    shift_secs(DateTime::now(), 3600)
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let report = app.state.sweeper.run(an_hour_later(), true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.found, 1);
    assert_eq!(report.expired, 0);

    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Pending);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::PendingPayment
    );
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
}

#[tokio::test]
async fn sweep_expires_and_frees_the_slot() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let report = app.state.sweeper.run(an_hour_later(), false).await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 0);

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::PaymentOverdue);
    assert!(invoice.hold_expires_at.is_some());
    assert!(invoice.synced);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::PaymentOverdue
    );
    assert!(!app.slot(&booked.slot_id).await.is_booked);
    assert_eq!(app.notifier.count(EventKind::PaymentOverdue), 1);

    // Nothing left to do on the next pass.
    let again = app.state.sweeper.run(an_hour_later(), false).await.unwrap();
    assert_eq!(again.found, 0);
}

#[tokio::test]
async fn sweep_leaves_current_and_paid_invoices_alone() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let report = app.state.sweeper.run(DateTime::now(), false).await.unwrap();
    assert_eq!(report.found, 0);

    app.payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    let report = app.state.sweeper.run(an_hour_later(), false).await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::Confirmed
    );
}

#[tokio::test]
async fn late_payment_with_free_slot_still_confirms() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    app.state.sweeper.run(an_hour_later(), false).await.unwrap();

    let (status, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");

    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Paid);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::Confirmed
    );
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
    assert_eq!(app.refunds.call_count(), 0);
}

#[tokio::test]
async fn late_payment_after_the_slot_was_rebooked_is_refunded() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    app.state.sweeper.run(an_hour_later(), false).await.unwrap();

    let (status, rebooked) = app.book_slot(OTHER_PATIENT, &booked.slot_id).await;
    assert_eq!(status, StatusCode::CREATED);
    let other_id = rebooked["appointment"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Refunded);
    assert_eq!(invoice.refund_reason.as_deref(), Some("slot_lost"));
    assert_eq!(app.refunds.call_count(), 1);

    let appointment = app.appointment(&booked.appointment_id).await;
    assert_eq!(appointment.status, AppointmentStatus::Cancelled);
    assert_eq!(appointment.cancel_reason.as_deref(), Some("slot_lost"));

    // The newer booking keeps the slot.
    assert!(app.slot(&booked.slot_id).await.is_held_by(&other_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payment_racing_the_sweep_always_ends_confirmed() {
    for _ in 0..10 {
        let app = TestApp::spawn();
        let booked = app.booked().await;
        let body = payos_body(&booked.reference_code, booked.amount, "TXN1");

        let sweeper = app.state.sweeper.clone();
        let sweep = tokio::spawn(async move { sweeper.run(an_hour_later(), false).await });
        let (status, ack) = app.payos_webhook(body).await;
        let report = sweep.await.unwrap().unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["success"], true);
        assert_eq!(report.failed, 0);

        assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Paid);
        assert_eq!(
            app.appointment(&booked.appointment_id).await.status,
            AppointmentStatus::Confirmed
        );
        assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
        assert_eq!(app.refunds.call_count(), 0);
    }
}

#[tokio::test]
async fn listing_failure_aborts_the_sweep() {
    let app = TestApp::spawn();
    app.booked().await;

    app.store.fail_next(1);
    assert!(app.state.sweeper.run(an_hour_later(), false).await.is_err());
}
