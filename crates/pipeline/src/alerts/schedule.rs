use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{Error, Result};

// Wire shape of the schedule JSON stored on a rule
#[derive(Debug, Deserialize)]
struct ScheduleSpec {
    #[serde(default)]
    days: Vec<String>,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

/// Active-hours window for a rule, evaluated in UTC.
///
/// `start_time > end_time` wraps past midnight (22:00-06:00 covers late
/// evening plus early morning). `start_time == end_time` covers the whole
/// day. An empty day list means every day.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSchedule {
    days: Vec<Weekday>,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

impl RuleSchedule {
    /// Parse the raw schedule JSON kept on an `AlertRule`.
    pub fn from_value(value: &JsonValue) -> Result<Self> {
        let spec: ScheduleSpec = serde_json::from_value(value.clone())?;

        let mut days = Vec::with_capacity(spec.days.len());
        for name in &spec.days {
            let day = name
                .parse::<Weekday>()
                .map_err(|_| Error::Client(format!("Invalid schedule day '{}'", name)))?;
            days.push(day);
        }

        Ok(Self {
            days,
            start_time: spec.start_time,
            end_time: spec.end_time,
        })
    }

    /// Whether `at` falls inside the window. The day check applies to the
    /// calendar day of `at` itself, so a wrapped window's early-morning tail
    /// needs the following day listed too.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }

        let time = at.time();
        if self.start_time == self.end_time {
            return true;
        }
        if self.start_time < self.end_time {
            time >= self.start_time && time < self.end_time
        } else {
            time >= self.start_time || time < self.end_time
        }
    }
}
