use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One firing of a timer, handed to the function once and then dropped.
///
/// Serializes to the shape function hosts deliver for timer bindings:
///
/// ```json
/// {"Schedule":"*/1 * * * * *","ScheduleStatus":{"Last":null,"Next":"...","LastUpdated":"..."},"IsPastDue":false}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimerInfo {
    /// The schedule this firing belongs to.
    pub schedule: Schedule,
    /// Bookkeeping about previous and upcoming occurrences.
    pub schedule_status: Option<ScheduleStatus>,
    /// `true` when the firing happens later than its scheduled occurrence,
    /// because the previous invocation overran one or more occurrences.
    pub is_past_due: bool,
}

impl TimerInfo {
    /// Creates a firing that is on time and carries no schedule status.
    pub fn new(schedule: Schedule) -> Self {
        TimerInfo {
            schedule,
            schedule_status: None,
            is_past_due: false,
        }
    }

    /// Marks the firing as past due.
    pub fn with_past_due(mut self, is_past_due: bool) -> Self {
        self.is_past_due = is_past_due;
        self
    }

    /// Attaches schedule bookkeeping.
    pub fn with_schedule_status(mut self, status: ScheduleStatus) -> Self {
        self.schedule_status = Some(status);
        self
    }

    /// Renders the host JSON payload.
    pub fn to_json(&self) -> String {
        // Only strings, bools and RFC 3339 timestamps are serialized.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Previous and next occurrence of a schedule, as known at firing time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduleStatus {
    /// Scheduled time of the previous firing, if any.
    pub last: Option<DateTime<Utc>>,
    /// Scheduled time of the following firing, if the schedule has one.
    pub next: Option<DateTime<Utc>>,
    /// When this status was computed.
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn json_payload_uses_host_field_names() {
        let schedule: Schedule = "*/1 * * * * *".parse().unwrap();
        let fired = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let timer = TimerInfo::new(schedule.clone())
            .with_past_due(true)
            .with_schedule_status(ScheduleStatus {
                last: None,
                next: schedule.next_after(fired),
                last_updated: fired,
            });

        let json: serde_json::Value = serde_json::from_str(&timer.to_json()).unwrap();
        assert_eq!(json["Schedule"], "*/1 * * * * *");
        assert_eq!(json["IsPastDue"], true);
        assert!(json["ScheduleStatus"]["Last"].is_null());
        assert_eq!(json["ScheduleStatus"]["Next"], "2024-01-01T00:00:02Z");
        assert_eq!(json["ScheduleStatus"]["LastUpdated"], "2024-01-01T00:00:01Z");
    }

    #[test]
    fn new_timer_is_on_time() {
        let timer = TimerInfo::new("00:00:05".parse().unwrap());
        assert!(!timer.is_past_due);
        assert!(timer.schedule_status.is_none());
        assert!(timer.to_json().contains("\"ScheduleStatus\":null"));
    }
}
