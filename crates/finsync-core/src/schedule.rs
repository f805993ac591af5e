use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid schedule time {0:?}: expected HH:MM")]
    Format(String),
    #[error("invalid schedule time {0:?}: hour must be 0-23 and minute 0-59")]
    OutOfRange(String),
}

/// Day-local trigger point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleTime {
    hour: u32,
    minute: u32,
}

impl ScheduleTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::OutOfRange(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        at.hour() == self.hour && at.minute() == self.minute
    }

    /// Parses a comma-separated list such as `"06:00, 18:30"`. Empty entries
    /// are ignored; any malformed entry fails the whole list.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ScheduleError> {
        let mut times = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Self>, _>>()?;
        times.sort();
        times.dedup();
        Ok(times)
    }
}

impl FromStr for ScheduleTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (hour, minute) = trimmed
            .split_once(':')
            .ok_or_else(|| ScheduleError::Format(trimmed.to_string()))?;
        let parse = |part: &str| {
            if part.is_empty() || part.len() > 2 || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(ScheduleError::Format(trimmed.to_string()));
            }
            part.parse::<u32>()
                .map_err(|_| ScheduleError::Format(trimmed.to_string()))
        };
        let (hour, minute) = (parse(hour)?, parse(minute)?);
        Self::new(hour, minute).map_err(|_| ScheduleError::OutOfRange(trimmed.to_string()))
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}
