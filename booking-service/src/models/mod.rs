pub mod actor;
pub mod appointment;
pub mod invoice;
pub mod ledger;
pub mod payment_event;
pub mod schedule;

pub use actor::{Actor, Role};
pub use appointment::{Appointment, AppointmentPatch, AppointmentStatus};
pub use invoice::{Invoice, InvoicePatch, InvoiceStatus, InvoiceType};
pub use ledger::{Admission, LedgerEntry, LedgerOutcome};
pub use payment_event::{PaymentChannel, PaymentEvent};
pub use schedule::ScheduleSlot;

use mongodb::bson::DateTime;

/// `at` shifted by `secs` seconds (negative moves into the past).
pub fn shift_secs(at: DateTime, secs: i64) -> DateTime {
    DateTime::from_millis(at.timestamp_millis().saturating_add(secs.saturating_mul(1000)))
}

/// RFC 3339 rendering for API responses.
pub fn rfc3339(at: DateTime) -> String {
    at.try_to_rfc3339_string()
        .unwrap_or_else(|_| at.timestamp_millis().to_string())
}
