//! Schedule definitions and fire-time arithmetic.

use std::str::FromStr;
use std::time::Duration;

use chrono::{Days, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// A wall-clock time of day, written `HH:MM`.
///
/// Only constructible through [`TimeOfDay::new`] or parsing, so the wrapped
/// time is always a whole minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    /// Create a time of day, validating the range.
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| {
                VigilError::Config(format!("invalid time of day {:02}:{:02}", hour, minute))
            })
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    /// As a `chrono` time.
    pub fn as_naive_time(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| VigilError::Config(format!("expected HH:MM, got '{}'", s)))?;
        let hour = hour
            .parse()
            .map_err(|_| VigilError::Config(format!("invalid hour in '{}'", s)))?;
        let minute = minute
            .parse()
            .map_err(|_| VigilError::Config(format!("invalid minute in '{}'", s)))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = VigilError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Every `every`, starting one period after the trigger starts
    Interval { every: Duration },
    /// At each listed local time of day
    Daily { times: Vec<TimeOfDay> },
}

impl Schedule {
    /// Reject schedules that would never fire or would spin.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Interval { every } if every.is_zero() => Err(VigilError::Config(
                "interval schedule must have a non-zero period".to_string(),
            )),
            Schedule::Daily { times } if times.is_empty() => Err(VigilError::Config(
                "daily schedule needs at least one time".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Interval { every } => write!(f, "every {}s", every.as_secs_f64()),
            Schedule::Daily { times } => {
                let times: Vec<String> = times.iter().map(|t| t.to_string()).collect();
                write!(f, "daily at {}", times.join(", "))
            }
        }
    }
}

/// The first listed time strictly after `now`, today or tomorrow.
pub fn next_daily_fire(now: NaiveDateTime, times: &[TimeOfDay]) -> Option<NaiveDateTime> {
    let today = now.date();
    let earliest = times.iter().map(|t| t.as_naive_time()).min()?;

    let later_today = times
        .iter()
        .map(|t| today.and_time(t.as_naive_time()))
        .filter(|candidate| *candidate > now)
        .min();

    later_today.or_else(|| {
        today
            .checked_add_days(Days::new(1))
            .map(|tomorrow| tomorrow.and_time(earliest))
    })
}

/// How many scheduled times fall in `(after, until]`.
pub fn daily_fires_between(after: NaiveDateTime, until: NaiveDateTime, times: &[TimeOfDay]) -> usize {
    let mut count = 0;
    let mut cursor = after;
    while let Some(next) = next_daily_fire(cursor, times) {
        if next > until {
            break;
        }
        count += 1;
        cursor = next;
    }
    count
}
