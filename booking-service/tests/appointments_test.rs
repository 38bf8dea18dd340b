mod common;

use axum::http::StatusCode;
use booking_service::models::{AppointmentStatus, InvoiceStatus};
use booking_service::services::notifier::EventKind;
use common::{admin, doctor, patient, payos_body, Booked, TestApp, DOCTOR, FEE, OTHER_PATIENT};
use serde_json::json;

async fn confirmed(app: &TestApp) -> Booked {
    let booked = app.booked().await;
    let (_, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN1"))
        .await;
    assert_eq!(body["outcome"], "applied");
    booked
}

#[tokio::test]
async fn booking_holds_the_slot_and_bills_the_consultation() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let appointment = app.appointment(&booked.appointment_id).await;
    assert_eq!(appointment.status, AppointmentStatus::PendingPayment);
    assert_eq!(appointment.doctor_id, DOCTOR);

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.amount, FEE);
    assert_eq!(invoice.reference_code.len(), 12);

    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
    assert_eq!(app.notifier.count(EventKind::InvoiceIssued), 1);
}

#[tokio::test]
async fn a_slot_is_booked_at_most_once() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let (status, _) = app.book_slot(OTHER_PATIENT, &booked.slot_id).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
}

#[tokio::test]
async fn only_patients_book_and_only_doctors_publish() {
    let app = TestApp::spawn();
    let slot_id = app.create_slot(DOCTOR, "10:00:00", "10:30:00").await;

    let (status, _) = app
        .post_json("/appointments", doctor(), json!({ "slot_id": slot_id }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post_json(
            "/slots",
            patient(),
            json!({ "date": "2030-03-04", "start_time": "11:00:00", "end_time": "11:30:00" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post_json(
            "/slots",
            doctor(),
            json!({ "date": "2030-03-04", "start_time": "11:30:00", "end_time": "11:00:00" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post_json(
            "/slots",
            admin(),
            json!({ "doctor_id": "doctor-9", "date": "2030-03-04", "start_time": "11:00:00", "end_time": "11:30:00" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["doctor_id"], "doctor-9");
    assert_eq!(body["is_booked"], false);
}

#[tokio::test]
async fn appointments_are_visible_to_participants_only() {
    let app = TestApp::spawn();
    let booked = app.booked().await;
    let uri = format!("/appointments/{}", booked.appointment_id);

    let (status, body) = app.get(&uri, patient()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_payment");

    assert_eq!(app.get(&uri, doctor()).await.0, StatusCode::OK);
    assert_eq!(app.get(&uri, admin()).await.0, StatusCode::OK);
    assert_eq!(
        app.get(&uri, Some((OTHER_PATIENT, "patient"))).await.0,
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        app.get("/appointments/missing", patient()).await.0,
        StatusCode::NOT_FOUND
    );

    let (status, invoices) = app
        .get(&format!("{}/invoices", uri), patient())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(invoices.as_array().map(Vec::len), Some(1));
    assert_eq!(invoices[0]["type"], "consultation");
}

#[tokio::test]
async fn approval_flow_bills_only_after_the_doctor_accepts() {
    let app = TestApp::spawn_with(|config| config.booking.require_doctor_approval = true);
    let slot_id = app.create_slot(DOCTOR, "09:00:00", "09:30:00").await;

    let (status, body) = app.book_slot(common::PATIENT, &slot_id).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["appointment"]["status"], "requested");
    assert!(body.get("invoice").is_none());
    let id = body["appointment"]["id"].as_str().unwrap().to_string();
    assert!(app.slot(&slot_id).await.is_held_by(&id));

    let (status, _) = app
        .post_empty(
            &format!("/appointments/{}/approve", id),
            Some(("doctor-2", "doctor")),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post_empty(&format!("/appointments/{}/approve", id), doctor())
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["appointment"]["status"], "pending_payment");
    assert_eq!(body["invoice"]["status"], "pending");
    assert_eq!(app.notifier.count(EventKind::AppointmentApproved), 1);

    let (status, _) = app
        .post_empty(&format!("/appointments/{}/approve", id), doctor())
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn rejecting_a_request_frees_the_slot() {
    let app = TestApp::spawn_with(|config| config.booking.require_doctor_approval = true);
    let slot_id = app.create_slot(DOCTOR, "09:00:00", "09:30:00").await;
    let (_, body) = app.book_slot(common::PATIENT, &slot_id).await;
    let id = body["appointment"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post_empty(&format!("/appointments/{}/reject", id), doctor())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancel_reason"], "rejected_by_doctor");
    assert!(!app.slot(&slot_id).await.is_booked);
    assert_eq!(app.notifier.count(EventKind::AppointmentRejected), 1);

    // Free again for someone else.
    let (status, _) = app.book_slot(OTHER_PATIENT, &slot_id).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn rejected_reschedule_returns_to_the_original_slot() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let s2 = app.create_slot(DOCTOR, "14:00:00", "14:30:00").await;

    let (status, body) = app
        .post_json(
            &format!("/appointments/{}/reschedule", booked.appointment_id),
            doctor(),
            json!({ "new_slot_id": s2 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "reschedule_requested");
    assert_eq!(body["proposed_schedule_id"], s2.as_str());
    assert!(app.slot(&s2).await.is_held_by(&booked.appointment_id));
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));

    let (status, body) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/reject", booked.appointment_id),
            patient(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["schedule_id"], booked.slot_id.as_str());
    assert!(body.get("proposed_schedule_id").is_none());

    assert!(!app.slot(&s2).await.is_booked);
    assert!(app.slot(&booked.slot_id).await.is_held_by(&booked.appointment_id));
}

#[tokio::test]
async fn accepted_reschedule_moves_the_appointment() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let s2 = app.create_slot(DOCTOR, "14:00:00", "14:30:00").await;
    app.post_json(
        &format!("/appointments/{}/reschedule", booked.appointment_id),
        doctor(),
        json!({ "new_slot_id": s2 }),
    )
    .await;

    let (status, _) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/accept", booked.appointment_id),
            Some((OTHER_PATIENT, "patient")),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/accept", booked.appointment_id),
            patient(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["schedule_id"], s2.as_str());

    assert!(app.slot(&s2).await.is_held_by(&booked.appointment_id));
    assert!(!app.slot(&booked.slot_id).await.is_booked);
    assert_eq!(app.notifier.count(EventKind::RescheduleAccepted), 1);
}

#[tokio::test]
async fn reschedule_needs_a_free_slot_of_the_same_doctor() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let foreign = app.create_slot("doctor-2", "14:00:00", "14:30:00").await;
    let uri = format!("/appointments/{}/reschedule", booked.appointment_id);

    let (status, _) = app
        .post_json(&uri, doctor(), json!({ "new_slot_id": foreign }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let taken = app.create_slot(DOCTOR, "15:00:00", "15:30:00").await;
    let (status, _) = app.book_slot(OTHER_PATIENT, &taken).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app
        .post_json(&uri, doctor(), json!({ "new_slot_id": taken }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::Confirmed
    );
}

#[tokio::test]
async fn doctor_self_accept_waits_for_the_patient() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let s2 = app.create_slot(DOCTOR, "14:00:00", "14:30:00").await;
    app.post_json(
        &format!("/appointments/{}/reschedule", booked.appointment_id),
        doctor(),
        json!({ "new_slot_id": s2 }),
    )
    .await;

    let (status, _) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/self-accept", booked.appointment_id),
            doctor(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::RescheduleRequested
    );
}

#[tokio::test]
async fn doctor_self_accepts_once_the_window_has_passed() {
    let app = TestApp::spawn_with(|config| config.booking.reschedule_auto_accept_secs = Some(0));
    let booked = confirmed(&app).await;
    let s2 = app.create_slot(DOCTOR, "14:00:00", "14:30:00").await;
    app.post_json(
        &format!("/appointments/{}/reschedule", booked.appointment_id),
        doctor(),
        json!({ "new_slot_id": s2 }),
    )
    .await;

    let (status, body) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/self-accept", booked.appointment_id),
            doctor(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["schedule_id"], s2.as_str());
    assert!(!app.slot(&booked.slot_id).await.is_booked);
}

#[tokio::test]
async fn self_accept_can_be_disabled() {
    let app = TestApp::spawn_with(|config| config.booking.reschedule_auto_accept_secs = None);
    let booked = confirmed(&app).await;
    let s2 = app.create_slot(DOCTOR, "14:00:00", "14:30:00").await;
    app.post_json(
        &format!("/appointments/{}/reschedule", booked.appointment_id),
        doctor(),
        json!({ "new_slot_id": s2 }),
    )
    .await;

    let (status, _) = app
        .post_empty(
            &format!("/appointments/{}/reschedule/self-accept", booked.appointment_id),
            doctor(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn cancelling_an_unpaid_booking_closes_its_invoice() {
    let app = TestApp::spawn();
    let booked = app.booked().await;

    let (status, body) = app
        .post_empty(
            &format!("/appointments/{}/cancel", booked.appointment_id),
            patient(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancel_reason"], "cancelled_by_patient");

    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Cancelled);
    assert!(!app.slot(&booked.slot_id).await.is_booked);

    let (status, _) = app
        .post_empty(
            &format!("/appointments/{}/cancel", booked.appointment_id),
            patient(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // A payment that arrives for the closed invoice is refused, not applied.
    let (status, body) = app
        .payos_webhook(payos_body(&booked.reference_code, booked.amount, "TXN-LATE"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "rejected");
}

#[tokio::test]
async fn cancel_reason_can_be_given() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;

    let (status, body) = app
        .post_json(
            &format!("/appointments/{}/cancel", booked.appointment_id),
            doctor(),
            json!({ "reason": "doctor unavailable" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_reason"], "doctor unavailable");
    // Paid consultations are refunded by an admin, not on cancel.
    assert_eq!(app.invoice(&booked.invoice_id).await.status, InvoiceStatus::Paid);
    assert_eq!(app.refunds.call_count(), 0);
}

#[tokio::test]
async fn completion_can_bill_a_final_settlement() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let uri = format!("/appointments/{}/complete", booked.appointment_id);

    let (status, _) = app.post_empty(&uri, patient()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post_json(&uri, doctor(), json!({ "settlement_amount": 350000 }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["appointment"]["status"], "completed");
    assert_eq!(body["invoice"]["type"], "final_settlement");
    assert_eq!(body["invoice"]["amount"], 350000);

    let (status, _) = app.post_empty(&uri, doctor()).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn completion_without_settlement() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;

    let (status, body) = app
        .post_empty(
            &format!("/appointments/{}/complete", booked.appointment_id),
            doctor(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "completed");
    assert!(body.get("invoice").is_none());
}

#[tokio::test]
async fn admin_refund_cancels_the_appointment() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    let uri = format!("/invoices/{}/refund", booked.invoice_id);

    let (status, _) = app
        .post_json(&uri, patient(), json!({ "reason": "changed my mind" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post_json(&uri, admin(), json!({ "reason": "clinic closed" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "refunded");
    assert_eq!(body["refund_reason"], "clinic closed");
    assert!(body["refund_ref"].as_str().is_some());
    assert_eq!(app.refunds.call_count(), 1);

    let appointment = app.appointment(&booked.appointment_id).await;
    assert_eq!(appointment.status, AppointmentStatus::Cancelled);
    assert_eq!(appointment.cancel_reason.as_deref(), Some("clinic closed"));
    assert!(!app.slot(&booked.slot_id).await.is_booked);

    let (status, _) = app
        .post_json(&uri, admin(), json!({ "reason": "again" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn failed_refund_keeps_the_invoice_paid() {
    let app = TestApp::spawn();
    let booked = confirmed(&app).await;
    app.refunds.set_failing(true);

    let (status, _) = app
        .post_json(
            &format!("/invoices/{}/refund", booked.invoice_id),
            admin(),
            json!({ "reason": "clinic closed" }),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let invoice = app.invoice(&booked.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(invoice.needs_review);
    assert_eq!(
        app.appointment(&booked.appointment_id).await.status,
        AppointmentStatus::Confirmed
    );
}
