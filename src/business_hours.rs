//! Weekly sending windows.
//!
//! Both dispatch paths gate on these two functions. They never touch shared
//! state, so the same config and instant always give the same answer.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub days: Vec<DaySchedule>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub weekday: String,
    #[serde(default)]
    pub enabled: bool,
    pub start: Option<String>,
    pub end: Option<String>,
    pub lunch_start: Option<String>,
    pub lunch_end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: NaiveTime,
    end: NaiveTime,
    lunch: Option<(NaiveTime, NaiveTime)>,
}

impl Window {
    fn in_lunch(&self, time: NaiveTime) -> bool {
        self.lunch
            .map(|(from, to)| time >= from && time < to)
            .unwrap_or(false)
    }
}

impl BusinessHoursConfig {
    fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Enabled and fully configured window for a weekday, if any.
    fn window_for(&self, weekday: Weekday) -> Option<Window> {
        let day = self
            .days
            .iter()
            .find(|d| parse_weekday(&d.weekday).ok() == Some(weekday))?;
        if !day.enabled {
            return None;
        }
        let start = parse_time(day.start.as_deref()?).ok()?;
        let end = parse_time(day.end.as_deref()?).ok()?;
        if start >= end {
            return None;
        }
        let lunch = match (day.lunch_start.as_deref(), day.lunch_end.as_deref()) {
            (Some(from), Some(to)) => match (parse_time(from), parse_time(to)) {
                (Ok(from), Ok(to)) if from < to => Some((from, to)),
                _ => None,
            },
            _ => None,
        };
        Some(Window { start, end, lunch })
    }

    /// Write-time validation of the schedule.
    pub fn validate(&self) -> Result<()> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| anyhow!("invalid timezone '{}'", self.timezone))?;

        let mut seen = Vec::new();
        for day in &self.days {
            let weekday = parse_weekday(&day.weekday)?;
            if seen.contains(&weekday) {
                bail!("weekday '{}' configured twice", day.weekday);
            }
            seen.push(weekday);

            if !day.enabled {
                continue;
            }
            let (Some(start), Some(end)) = (day.start.as_deref(), day.end.as_deref()) else {
                bail!("{}: enabled day needs start and end", day.weekday);
            };
            let start = parse_time(start)?;
            let end = parse_time(end)?;
            if start >= end {
                bail!("{}: start must be before end", day.weekday);
            }
            match (day.lunch_start.as_deref(), day.lunch_end.as_deref()) {
                (None, None) => {}
                (Some(from), Some(to)) => {
                    let from = parse_time(from)?;
                    let to = parse_time(to)?;
                    if from >= to {
                        bail!("{}: lunch start must be before lunch end", day.weekday);
                    }
                    if from < start || to > end {
                        bail!("{}: lunch must fall inside working hours", day.weekday);
                    }
                }
                _ => bail!("{}: lunch needs both start and end", day.weekday),
            }
        }
        Ok(())
    }
}

/// True when `now` falls inside the day's working hours and outside lunch.
///
/// Comparison happens at minute resolution: start and end are inclusive,
/// lunch excludes its start minute up to (not including) its end minute.
pub fn is_within_window(config: &BusinessHoursConfig, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&config.tz());
    let Some(window) = config.window_for(local.weekday()) else {
        return false;
    };
    let time = truncate_to_minute(local.time());
    time >= window.start && time <= window.end && !window.in_lunch(time)
}

/// Next instant at which sending is allowed, `now` itself when already inside
/// the window, `None` when no day of the week is usable.
pub fn next_window_start(config: &BusinessHoursConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz = config.tz();
    let local = now.with_timezone(&tz);
    let today = local.date_naive();
    let time = truncate_to_minute(local.time());

    for offset in 0..=7 {
        let date = today + Duration::days(offset);
        let Some(window) = config.window_for(date.weekday()) else {
            continue;
        };
        if offset == 0 {
            if time > window.end {
                continue;
            }
            if time < window.start {
                if let Some(at) = local_instant(&tz, date, window.start) {
                    return Some(at);
                }
                continue;
            }
            if let Some((_, lunch_end)) = window.lunch.filter(|_| window.in_lunch(time)) {
                if let Some(at) = local_instant(&tz, date, lunch_end) {
                    return Some(at);
                }
                continue;
            }
            return Some(now);
        }
        if let Some(at) = local_instant(&tz, date, window.start) {
            return Some(at);
        }
    }
    None
}

fn local_instant(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

pub fn parse_time(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|err| anyhow!("invalid time '{}': {}", value, err))
}

pub fn parse_weekday(value: &str) -> Result<Weekday> {
    match value.trim().to_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tues" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thur" | "thurs" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(anyhow!("invalid weekday '{}': expected mon..sun", other)),
    }
}
