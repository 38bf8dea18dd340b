use chrono::{NaiveDate, NaiveTime};
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bookable block of a doctor's time.
///
/// `held_by` names the appointment holding the slot while `is_booked` is set;
/// releases are conditional on it so a late release never frees a slot that
/// another appointment has claimed since. A release may additionally pin
/// `hold_version`, which lets the expiry path back off when a late payment
/// renewed the hold in the meantime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScheduleSlot {
    #[serde(rename = "_id")]
    pub id: String,
    pub doctor_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_booked: bool,
    #[serde(default)]
    pub held_by: Option<String>,
    /// Bumped by every reservation, so a release can target one specific hold.
    #[serde(default)]
    pub hold_version: i64,
    pub updated_at: DateTime,
}

impl ScheduleSlot {
    pub fn new(
        doctor_id: &str,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        now: DateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            doctor_id: doctor_id.to_string(),
            date,
            start_time,
            end_time,
            is_booked: false,
            held_by: None,
            hold_version: 0,
            updated_at: now,
        }
    }

    pub fn is_held_by(&self, appointment_id: &str) -> bool {
        self.is_booked && self.held_by.as_deref() == Some(appointment_id)
    }
}
