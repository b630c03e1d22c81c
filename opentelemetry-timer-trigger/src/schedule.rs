//! Timer schedules.
//!
//! Two notations are accepted:
//!
//! * NCRONTAB with six fields, `{second} {minute} {hour} {day} {month} {day-of-week}`,
//!   e.g. `*/1 * * * * *` (every second) or `0 30 9 * * MON-FRI`.
//! * A fixed interval written as `hh:mm:ss` or `d.hh:mm:ss`, e.g. `00:00:05`.
//!
//! All computations happen in UTC with second resolution.
use crate::error::ScheduleError;
use chrono::{
    DateTime, Datelike, Months, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc,
};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// February 29th on a given weekday recurs within 28 years.
const SEARCH_HORIZON_YEARS: i32 = 30;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const SECOND: Field = Field::new("second", 0, 59, &[]);
const MINUTE: Field = Field::new("minute", 0, 59, &[]);
const HOUR: Field = Field::new("hour", 0, 23, &[]);
const DAY: Field = Field::new("day", 1, 31, &[]);
const MONTH: Field = Field::new("month", 1, 12, MONTH_NAMES);
const DAY_OF_WEEK: Field = Field::new("day-of-week", 0, 6, DAY_NAMES);

/// When a timer fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// A six-field NCRONTAB expression.
    Cron(CronSchedule),
    /// A fixed period between occurrences.
    Interval(Duration),
}

impl Schedule {
    /// Returns the first occurrence strictly after `after`.
    ///
    /// `None` means the schedule never fires again, e.g. `0 0 0 31 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(cron) => cron.next_after(after),
            Schedule::Interval(period) => {
                after.checked_add_signed(TimeDelta::from_std(*period).ok()?)
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') && !s.contains(char::is_whitespace) {
            parse_interval(s).map(Schedule::Interval)
        } else {
            s.parse().map(Schedule::Cron)
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(cron) => f.write_str(&cron.expression),
            Schedule::Interval(period) => {
                let total = period.as_secs();
                let (days, rest) = (total / 86_400, total % 86_400);
                if days > 0 {
                    write!(f, "{days}.")?;
                }
                write!(
                    f,
                    "{:02}:{:02}:{:02}",
                    rest / 3_600,
                    rest % 3_600 / 60,
                    rest % 60
                )
            }
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn parse_interval(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let (days, clock) = match s.split_once('.') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| invalid())?, clock),
        None => (0, s),
    };
    let parts = clock
        .split(':')
        .map(|part| part.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    let [hours, minutes, seconds] = parts[..] else {
        return Err(invalid());
    };
    if hours > 23 || minutes > 59 || seconds > 59 {
        return Err(invalid());
    }
    let total = days
        .checked_mul(86_400)
        .and_then(|total| total.checked_add(hours * 3_600 + minutes * 60 + seconds))
        .filter(|total| *total > 0)
        .ok_or_else(invalid)?;
    Ok(Duration::from_secs(total))
}

/// A parsed six-field NCRONTAB expression.
///
/// Day-of-month and day-of-week must both match for a day to be selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
}

impl CronSchedule {
    /// The expression this schedule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns the first matching instant strictly after `after`, truncated to
    /// whole seconds.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.naive_utc().with_nanosecond(0)? + TimeDelta::seconds(1);
        let horizon = t.year() + SEARCH_HORIZON_YEARS;

        loop {
            if t.year() > horizon {
                return None;
            }
            if !self.months.contains(t.month()) {
                let first = t.date().with_day(1)?.checked_add_months(Months::new(1))?;
                t = NaiveDateTime::new(first, NaiveTime::default());
                continue;
            }
            if !self.days.contains(t.day())
                || !self.weekdays.contains(t.weekday().num_days_from_sunday())
            {
                t = NaiveDateTime::new(t.date().succ_opt()?, NaiveTime::default());
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = NaiveDateTime::new(t.date(), NaiveTime::from_hms_opt(t.hour(), 0, 0)?)
                    + TimeDelta::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = NaiveDateTime::new(
                    t.date(),
                    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0)?,
                ) + TimeDelta::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += TimeDelta::seconds(1);
                continue;
            }
            return Some(t.and_utc());
        }
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [second, minute, hour, day, month, weekday] = fields[..] else {
            return Err(ScheduleError::FieldCount {
                expression: s.to_string(),
                found: fields.len(),
            });
        };

        Ok(CronSchedule {
            expression: fields.join(" "),
            seconds: SECOND.parse(second)?,
            minutes: MINUTE.parse(minute)?,
            hours: HOUR.parse(hour)?,
            days: DAY.parse(day)?,
            months: MONTH.parse(month)?,
            weekdays: DAY_OF_WEEK.parse(weekday)?,
        })
    }
}

/// Bit `n` is set when value `n` is selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < u64::BITS && self.0 & (1 << value) != 0
    }
}

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    // names[i] stands for min + i
    names: &'static [&'static str],
}

impl Field {
    const fn new(name: &'static str, min: u32, max: u32, names: &'static [&'static str]) -> Self {
        Field {
            name,
            min,
            max,
            names,
        }
    }

    fn parse(&self, text: &str) -> Result<FieldSet, ScheduleError> {
        let mut bits = 0u64;
        for item in text.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(self.parse_step(step)?)),
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((start, end)) = range.split_once('-') {
                let (start, end) = (self.parse_value(start)?, self.parse_value(end)?);
                if start > end {
                    return Err(ScheduleError::ReversedRange {
                        field: self.name,
                        start,
                        end,
                    });
                }
                (start, end)
            } else {
                let value = self.parse_value(range)?;
                // `a/s` runs from a to the end of the field
                (value, if step.is_some() { self.max } else { value })
            };

            for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
                bits |= 1 << value;
            }
        }
        Ok(FieldSet(bits))
    }

    fn parse_value(&self, text: &str) -> Result<u32, ScheduleError> {
        let value = match text.parse::<u32>() {
            Ok(value) => value,
            Err(_) => self
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(text))
                .map(|index| self.min + index as u32)
                .ok_or_else(|| ScheduleError::InvalidValue {
                    field: self.name,
                    value: text.to_string(),
                })?,
        };
        if value < self.min || value > self.max {
            return Err(ScheduleError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }

    fn parse_step(&self, text: &str) -> Result<u32, ScheduleError> {
        let step = text
            .parse::<u32>()
            .map_err(|_| ScheduleError::InvalidValue {
                field: self.name,
                value: text.to_string(),
            })?;
        if step == 0 {
            return Err(ScheduleError::ZeroStep { field: self.name });
        }
        Ok(step)
    }
}
