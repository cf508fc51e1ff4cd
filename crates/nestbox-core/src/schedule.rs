//! Schedule expressions for recurring tasks.
//!
//! `cron` accepts classic 5-field expressions (seconds are implied as `0`)
//! as well as the 6/7-field form. `interval` is a positive number of
//! milliseconds. `once` is an RFC 3339 timestamp or a naive local
//! `YYYY-MM-DDTHH:MM[:SS]` timestamp.

use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a task's `schedule_value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => Err(Error::Schedule(format!("unknown schedule type '{other}'"))),
        }
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a scheduled run sees the group's conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

impl ContextMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Isolated => "isolated",
        }
    }
}

impl FromStr for ContextMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "group" => Ok(Self::Group),
            "isolated" => Ok(Self::Isolated),
            other => Err(Error::Schedule(format!("unknown context mode '{other}'"))),
        }
    }
}

fn parse_cron(value: &str) -> Result<cron::Schedule> {
    let fields = value.split_whitespace().count();
    let expr = if fields == 5 {
        format!("0 {value}")
    } else {
        value.to_string()
    };
    cron::Schedule::from_str(&expr)
        .map_err(|e| Error::Schedule(format!("invalid cron expression '{value}': {e}")))
}

fn parse_interval(value: &str) -> Result<i64> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(Error::Schedule(format!(
            "interval must be a positive number of milliseconds, got '{value}'"
        ))),
    }
}

fn parse_once(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format)
            && let Some(local) = Local.from_local_datetime(&naive).earliest()
        {
            return Ok(local.with_timezone(&Utc));
        }
    }
    Err(Error::Schedule(format!("invalid timestamp '{value}'")))
}

/// Check a schedule without computing anything from it.
pub fn validate(schedule_type: ScheduleType, value: &str) -> Result<()> {
    match schedule_type {
        ScheduleType::Cron => parse_cron(value).map(|_| ()),
        ScheduleType::Interval => parse_interval(value).map(|_| ()),
        ScheduleType::Once => parse_once(value).map(|_| ()),
    }
}

/// First run of a freshly created task, in milliseconds since the epoch.
pub fn first_run(schedule_type: ScheduleType, value: &str, now: DateTime<Utc>) -> Result<i64> {
    match schedule_type {
        ScheduleType::Once => Ok(parse_once(value)?.timestamp_millis()),
        _ => next_run(schedule_type, value, now)?
            .ok_or_else(|| Error::Schedule(format!("schedule '{value}' never fires"))),
    }
}

/// Run following one that happened at `now`; `None` when the task is done.
pub fn next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    match schedule_type {
        ScheduleType::Cron => {
            let schedule = parse_cron(value)?;
            let local_now = now.with_timezone(&Local);
            Ok(schedule
                .after(&local_now)
                .next()
                .map(|next| next.with_timezone(&Utc).timestamp_millis()))
        }
        ScheduleType::Interval => Ok(Some(now.timestamp_millis() + parse_interval(value)?)),
        ScheduleType::Once => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(validate(ScheduleType::Cron, "0 9 * * 1").is_ok());
        assert!(validate(ScheduleType::Cron, "0 0 9 * * Mon *").is_ok());
    }

    #[test]
    fn garbage_cron_is_rejected() {
        let err = validate(ScheduleType::Cron, "every tuesday").unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn cron_next_run_is_in_the_future() {
        let now = Utc::now();
        let next = next_run(ScheduleType::Cron, "0/5 * * * *", now)
            .unwrap()
            .unwrap();
        assert!(next > now.timestamp_millis());
        assert!(next <= now.timestamp_millis() + 5 * 60 * 1000);
    }

    #[test]
    fn interval_must_be_positive() {
        assert!(validate(ScheduleType::Interval, "0").is_err());
        assert!(validate(ScheduleType::Interval, "-10").is_err());
        assert!(validate(ScheduleType::Interval, "soon").is_err());
        let now = Utc::now();
        assert_eq!(
            next_run(ScheduleType::Interval, "60000", now).unwrap(),
            Some(now.timestamp_millis() + 60_000)
        );
    }

    #[test]
    fn once_accepts_rfc3339_and_naive_local() {
        let ts = first_run(
            ScheduleType::Once,
            "2030-01-01T00:00:00Z",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(ts, 1_893_456_000_000);
        assert!(validate(ScheduleType::Once, "2030-01-01T09:30").is_ok());
        assert!(validate(ScheduleType::Once, "tomorrow").is_err());
    }

    #[test]
    fn once_has_no_follow_up() {
        assert_eq!(
            next_run(ScheduleType::Once, "2030-01-01T00:00:00Z", Utc::now()).unwrap(),
            None
        );
    }

    #[test]
    fn schedule_type_round_trips_through_str() {
        for ty in [ScheduleType::Cron, ScheduleType::Interval, ScheduleType::Once] {
            assert_eq!(ty.as_str().parse::<ScheduleType>().unwrap(), ty);
        }
        assert!("weekly".parse::<ScheduleType>().is_err());
    }
}
