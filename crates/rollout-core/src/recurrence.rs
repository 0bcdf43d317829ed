//! Recurrence rules for deployment windows.
//!
//! Supports the subset of RFC 5545 that deployment windows use, evaluated in
//! UTC:
//!
//! - an optional `DTSTART:YYYYMMDDTHHMMSSZ` line (defaults to the Unix epoch)
//! - `FREQ` of `MINUTELY`, `HOURLY`, `DAILY`, `WEEKLY`, `MONTHLY` or `YEARLY`
//! - `INTERVAL`, `UNTIL`, `BYMONTH`, `BYMONTHDAY` (negative counts from the end
//!   of the month), `BYDAY` (plain weekday codes), `BYHOUR`, `BYMINUTE`
//!
//! `COUNT`, `TZID` and ordinal `BYDAY` entries (`1MO`) are rejected.
//!
//! Occurrences are generated one day at a time, which keeps lookups bounded
//! regardless of how far `DTSTART` lies in the past.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc, Weekday};
use std::str::FromStr;

/// Longest look-ahead when searching for the next occurrence
const SEARCH_HORIZON_DAYS: i64 = 366 * 8;

/// Recurrence frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    /// Every minute
    Minutely,
    /// Every hour
    Hourly,
    /// Every day
    Daily,
    /// Every week
    Weekly,
    /// Every month
    Monthly,
    /// Every year
    Yearly,
}

impl FromStr for Frequency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MINUTELY" => Ok(Frequency::Minutely),
            "HOURLY" => Ok(Frequency::Hourly),
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "YEARLY" => Ok(Frequency::Yearly),
            other => Err(CoreError::RecurrenceError(format!("Unsupported FREQ {}", other))),
        }
    }
}

/// A parsed recurrence rule
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    dtstart: DateTime<Utc>,
    freq: Frequency,
    interval: u32,
    until: Option<DateTime<Utc>>,
    by_month: Vec<u32>,
    by_month_day: Vec<i32>,
    by_day: Vec<Weekday>,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
}

/// A concrete occurrence `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl RecurrenceRule {
    /// Parse a rule, optionally preceded by a `DTSTART` line
    pub fn parse(text: &str) -> CoreResult<Self> {
        let mut dtstart = None;
        let mut rule_body = None;

        for line in text.split(|c: char| c == '\n' || c == '\r' || c == ' ').filter(|l| !l.is_empty()) {
            if let Some(value) = line.strip_prefix("DTSTART:") {
                dtstart = Some(parse_datetime(value)?);
            } else if line.starts_with("DTSTART;") {
                return Err(CoreError::RecurrenceError(
                    "DTSTART parameters (TZID) are not supported; use UTC".to_string(),
                ));
            } else if let Some(body) = line.strip_prefix("RRULE:") {
                rule_body = Some(body.to_string());
            } else {
                rule_body = Some(line.to_string());
            }
        }

        let body = rule_body
            .ok_or_else(|| CoreError::RecurrenceError("Missing RRULE".to_string()))?;

        let mut freq = None;
        let mut rule = RecurrenceRule {
            dtstart: dtstart.unwrap_or_else(|| Utc.timestamp_nanos(0)),
            freq: Frequency::Daily,
            interval: 1,
            until: None,
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
        };

        for part in body.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CoreError::RecurrenceError(format!("Malformed rule part {}", part)))?;
            match key {
                "FREQ" => freq = Some(value.parse()?),
                "INTERVAL" => {
                    rule.interval = parse_number(key, value)?;
                    if rule.interval == 0 {
                        return Err(CoreError::RecurrenceError("INTERVAL must be positive".to_string()));
                    }
                }
                "UNTIL" => rule.until = Some(parse_datetime(value)?),
                "BYMONTH" => rule.by_month = parse_list(key, value, 1, 12)?,
                "BYMONTHDAY" => {
                    rule.by_month_day = parse_list::<i32>(key, value, -31, 31)?;
                    if rule.by_month_day.contains(&0) {
                        return Err(CoreError::RecurrenceError("BYMONTHDAY cannot be 0".to_string()));
                    }
                }
                "BYDAY" => {
                    rule.by_day = value
                        .split(',')
                        .map(parse_weekday)
                        .collect::<CoreResult<Vec<_>>>()?
                }
                "BYHOUR" => rule.by_hour = parse_list(key, value, 0, 23)?,
                "BYMINUTE" => rule.by_minute = parse_list(key, value, 0, 59)?,
                "WKST" => {}
                other => {
                    return Err(CoreError::RecurrenceError(format!("Unsupported rule part {}", other)))
                }
            }
        }

        rule.freq = freq.ok_or_else(|| CoreError::RecurrenceError("Missing FREQ".to_string()))?;
        Ok(rule)
    }

    /// Frequency of the rule
    pub fn frequency(&self) -> Frequency {
        self.freq
    }

    /// The occurrence of length `duration` containing `at`, if any.
    ///
    /// When occurrences overlap the latest one wins.
    pub fn occurrence_containing(&self, at: DateTime<Utc>, duration: Duration) -> Option<Occurrence> {
        if duration <= Duration::zero() {
            return None;
        }
        let earliest = at - duration;
        let mut latest = None;

        let mut day = earliest.date_naive();
        while day <= at.date_naive() {
            for start in self.starts_on(day) {
                if start > earliest && start <= at {
                    latest = Some(start);
                }
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        latest.map(|start| Occurrence { start, end: start + duration })
    }

    /// First occurrence start strictly after `at`
    pub fn next_start_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(until) = self.until {
            if until <= at {
                return None;
            }
        }

        let mut day = at.date_naive().max(self.dtstart.date_naive());
        let horizon = day + Duration::days(SEARCH_HORIZON_DAYS * i64::from(self.interval.min(16)));
        while day <= horizon {
            if let Some(start) = self.starts_on(day).into_iter().find(|s| *s > at) {
                return Some(start);
            }
            day = day.succ_opt()?;
        }
        None
    }

    /// Occurrence starts on a given UTC day, ascending
    pub fn starts_on(&self, day: NaiveDate) -> Vec<DateTime<Utc>> {
        if day < self.dtstart.date_naive() || !self.day_matches(day) {
            return Vec::new();
        }

        let hours: Vec<u32> = if !self.by_hour.is_empty() {
            sorted(&self.by_hour)
        } else if self.freq <= Frequency::Hourly {
            (0..24).collect()
        } else {
            vec![self.dtstart.hour()]
        };
        let minutes: Vec<u32> = if !self.by_minute.is_empty() {
            sorted(&self.by_minute)
        } else if self.freq == Frequency::Minutely {
            (0..60).collect()
        } else {
            vec![self.dtstart.minute()]
        };
        let second = self.dtstart.second();

        let mut starts = Vec::new();
        for hour in &hours {
            for minute in &minutes {
                let Some(naive) = day.and_hms_opt(*hour, *minute, second) else {
                    continue;
                };
                let candidate = Utc.from_utc_datetime(&naive);
                if candidate < self.dtstart {
                    continue;
                }
                if self.until.map(|until| candidate > until).unwrap_or(false) {
                    continue;
                }
                if !self.sub_day_interval_matches(candidate) {
                    continue;
                }
                starts.push(candidate);
            }
        }
        starts
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        let start = self.dtstart.date_naive();

        if !self.by_month.is_empty() && !self.by_month.contains(&day.month()) {
            return false;
        }

        if !self.by_month_day.is_empty() {
            let last = last_day_of_month(day);
            let matches = self.by_month_day.iter().any(|&d| {
                if d > 0 {
                    day.day() == d as u32
                } else {
                    i64::from(day.day()) == i64::from(last) + 1 + i64::from(d)
                }
            });
            if !matches {
                return false;
            }
        }

        if !self.by_day.is_empty() && !self.by_day.contains(&day.weekday()) {
            return false;
        }

        let no_day_rules = self.by_month_day.is_empty() && self.by_day.is_empty();
        match self.freq {
            Frequency::Yearly => {
                if no_day_rules {
                    if self.by_month.is_empty() && day.month() != start.month() {
                        return false;
                    }
                    if day.day() != start.day() {
                        return false;
                    }
                }
                (day.year() - start.year()) % self.interval as i32 == 0
            }
            Frequency::Monthly => {
                if no_day_rules && day.day() != start.day() {
                    return false;
                }
                let months = (day.year() - start.year()) * 12 + day.month() as i32 - start.month() as i32;
                months % self.interval as i32 == 0
            }
            Frequency::Weekly => {
                if self.by_day.is_empty() && day.weekday() != start.weekday() {
                    return false;
                }
                let week_of = |d: NaiveDate| {
                    d - Duration::days(i64::from(d.weekday().num_days_from_monday()))
                };
                let weeks = (week_of(day) - week_of(start)).num_days() / 7;
                weeks % i64::from(self.interval) == 0
            }
            Frequency::Daily => (day - start).num_days() % i64::from(self.interval) == 0,
            Frequency::Hourly | Frequency::Minutely => true,
        }
    }

    fn sub_day_interval_matches(&self, candidate: DateTime<Utc>) -> bool {
        let unit = match self.freq {
            Frequency::Hourly => 3600,
            Frequency::Minutely => 60,
            _ => return true,
        };
        let elapsed = candidate.timestamp().div_euclid(unit) - self.dtstart.timestamp().div_euclid(unit);
        elapsed % i64::from(self.interval) == 0
    }
}

impl FromStr for RecurrenceRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecurrenceRule::parse(s)
    }
}

fn sorted(values: &[u32]) -> Vec<u32> {
    let mut values = values.to_vec();
    values.sort_unstable();
    values.dedup();
    values
}

fn last_day_of_month(day: NaiveDate) -> u32 {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::RecurrenceError(format!("Invalid {} value {}", key, value)))
}

fn parse_list<T>(key: &str, value: &str, min: T, max: T) -> CoreResult<Vec<T>>
where
    T: FromStr + PartialOrd + Copy,
{
    value
        .split(',')
        .map(|item| {
            let parsed: T = parse_number(key, item)?;
            if parsed < min || parsed > max {
                return Err(CoreError::RecurrenceError(format!("{} value {} out of range", key, item)));
            }
            Ok(parsed)
        })
        .collect()
}

fn parse_weekday(code: &str) -> CoreResult<Weekday> {
    match code.trim() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(CoreError::RecurrenceError(format!("Unsupported BYDAY value {}", other))),
    }
}

fn parse_datetime(value: &str) -> CoreResult<DateTime<Utc>> {
    let trimmed = value.trim();
    let naive = if trimmed.len() == 8 {
        NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(23, 59, 59))
    } else {
        NaiveDateTime::parse_from_str(trimmed.trim_end_matches('Z'), "%Y%m%dT%H%M%S").ok()
    };
    naive
        .map(|n| Utc.from_utc_datetime(&n))
        .ok_or_else(|| CoreError::RecurrenceError(format!("Invalid date-time {}", value)))
}
