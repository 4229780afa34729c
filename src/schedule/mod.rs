//! Digest schedule settings and their recurring-trigger pattern

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::database::{Database, StoreError};

mod scheduler;

pub use scheduler::DigestScheduler;

/// Settings key holding the JSON-encoded [`ScheduleSettings`].
pub const SCHEDULE_SETTING_KEY: &str = "email_schedule";

const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("hour must be between 0 and 23, got {0}")]
    HourOutOfRange(u32),

    #[error("minute must be between 0 and 59, got {0}")]
    MinuteOutOfRange(u32),

    #[error("weekly schedules require a dayOfWeek")]
    MissingDayOfWeek,

    #[error("dayOfWeek must be between 1 (Monday) and 7 (Sunday), got {0}")]
    DayOfWeekOutOfRange(u32),

    #[error("unsupported trigger pattern {0:?}")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
}

/// When the digest goes out. Hours are UTC; days are ISO (1 = Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSettings {
    pub frequency: Frequency,
    pub hour: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u32>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            frequency: Frequency::Daily,
            hour: 9,
            minute: None,
            day_of_week: None,
        }
    }
}

impl ScheduleSettings {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.hour > 23 {
            return Err(ScheduleError::HourOutOfRange(self.hour));
        }
        if let Some(minute) = self.minute
            && minute > 59
        {
            return Err(ScheduleError::MinuteOutOfRange(minute));
        }
        if self.frequency == Frequency::Weekly {
            match self.day_of_week {
                None => return Err(ScheduleError::MissingDayOfWeek),
                Some(day) if !(1..=7).contains(&day) => {
                    return Err(ScheduleError::DayOfWeekOutOfRange(day));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Five-field `"minute hour * * dayOfWeek"` pattern, `*` for daily.
    pub fn to_trigger_pattern(&self) -> Result<String, ScheduleError> {
        self.validate()?;

        let minute = self.minute.unwrap_or(0);
        let day = match (self.frequency, self.day_of_week) {
            (Frequency::Weekly, Some(day)) => day.to_string(),
            _ => "*".to_string(),
        };

        Ok(format!("{minute} {} * * {day}", self.hour))
    }
}

/// Fields of a pattern this module knows how to produce
struct SimplePattern {
    minute: u32,
    hour: u32,
    /// ISO weekday, `None` for every day
    day_of_week: Option<u32>,
}

fn parse_pattern(pattern: &str) -> Option<SimplePattern> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    let [minute, hour, "*", "*", day] = fields.as_slice() else {
        return None;
    };

    let minute = minute.parse::<u32>().ok().filter(|m| *m <= 59)?;
    let hour = hour.parse::<u32>().ok().filter(|h| *h <= 23)?;
    let day_of_week = match *day {
        "*" => None,
        day => Some(day.parse::<u32>().ok().filter(|d| (1..=7).contains(d))?),
    };

    Some(SimplePattern {
        minute,
        hour,
        day_of_week,
    })
}

/// Human description of a trigger pattern, e.g. `"Every Monday at 09:00"`.
pub fn describe(pattern: &str) -> String {
    let Some(parsed) = parse_pattern(pattern) else {
        return format!("Custom schedule: {pattern}");
    };

    let time = format!("{:02}:{:02}", parsed.hour, parsed.minute);
    match parsed.day_of_week {
        None => format!("Every day at {time}"),
        Some(day) => format!("Every {} at {time}", DAY_NAMES[(day - 1) as usize]),
    }
}

/// The persisted schedule, or the daily 09:00 default when it is missing,
/// unreadable or invalid.
pub async fn load_schedule(db: &Database) -> Result<ScheduleSettings, StoreError> {
    let Some(raw) = db.get_setting(SCHEDULE_SETTING_KEY).await? else {
        return Ok(ScheduleSettings::default());
    };

    let settings = match serde_json::from_str::<ScheduleSettings>(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Stored schedule is not valid JSON ({}), using default", e);
            return Ok(ScheduleSettings::default());
        }
    };

    if let Err(e) = settings.validate() {
        warn!("Stored schedule is invalid ({}), using default", e);
        return Ok(ScheduleSettings::default());
    }

    Ok(settings)
}

#[derive(Debug, Error)]
pub enum SaveScheduleError {
    #[error(transparent)]
    Invalid(#[from] ScheduleError),

    #[error("failed to encode schedule: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate and persist the schedule. Returns its trigger pattern.
pub async fn save_schedule(db: &Database, settings: &ScheduleSettings) -> Result<String, SaveScheduleError> {
    let pattern = settings.to_trigger_pattern()?;
    let raw = serde_json::to_string(settings)?;
    db.put_setting(SCHEDULE_SETTING_KEY, &raw).await?;
    Ok(pattern)
}
