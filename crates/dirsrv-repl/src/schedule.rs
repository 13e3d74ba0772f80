//! Replication update schedules.
//!
//! A schedule is a list of windows in `HHMM-HHMM DAYS` form, e.g.
//! `0800-1730 12345`. Days are digits, `0` = Sunday. A window whose end is
//! before its start wraps past midnight and belongs to the day it starts on.
//! An empty schedule means "always".

use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agreement attribute holding the schedule.
pub const ATTR_UPDATE_SCHEDULE: &str = "nsds5replicaupdateschedule";

const MINUTES_PER_DAY: u16 = 24 * 60;

/// One replication window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    start: u16,
    end: u16,
    days: [bool; 7],
}

impl Window {
    /// Parse `HHMM-HHMM DAYS`.
    pub fn parse(s: &str) -> Result<Self, ReplError> {
        let mut parts = s.split_whitespace();
        let (Some(times), Some(days), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(reject(s, "expected HHMM-HHMM DAYS"));
        };
        let (start, end) = times.split_once('-').ok_or_else(|| reject(s, "missing '-' in time range"))?;
        let start = parse_hhmm(start).ok_or_else(|| reject(s, "bad start time"))?;
        let end = parse_hhmm(end).ok_or_else(|| reject(s, "bad end time"))?;
        let mut mask = [false; 7];
        for c in days.chars() {
            let day = c
                .to_digit(10)
                .filter(|d| *d < 7)
                .ok_or_else(|| reject(s, "days must be digits 0-6"))?;
            mask[day as usize] = true;
        }
        Ok(Self { start, end, days: mask })
    }

    fn contains(&self, day: usize, minute: u16) -> bool {
        let prev = (day + 6) % 7;
        if self.start == self.end {
            self.days[day]
        } else if self.start < self.end {
            self.days[day] && minute >= self.start && minute < self.end
        } else {
            (self.days[day] && minute >= self.start) || (self.days[prev] && minute < self.end)
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: String = (0..7).filter(|d| self.days[*d]).map(|d| char::from(b'0' + d as u8)).collect();
        write!(
            f,
            "{:02}{:02}-{:02}{:02} {}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60,
            days
        )
    }
}

fn reject(value: &str, msg: &str) -> ReplError {
    ReplError::ConfigRejected {
        attr: ATTR_UPDATE_SCHEDULE.to_string(),
        code: LdapResultCode::UnwillingToPerform,
        msg: format!("{value:?}: {msg}"),
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: u16 = s[..2].parse().ok()?;
    let minutes: u16 = s[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn day_and_minute(at: &NaiveDateTime) -> (usize, u16) {
    (
        at.weekday().num_days_from_sunday() as usize,
        (at.hour() * 60 + at.minute()) as u16,
    )
}

/// A set of windows plus attributes whose changes bypass them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    windows: Vec<Window>,
    priority_attrs: Vec<String>,
}

impl Schedule {
    /// Always-open schedule.
    pub fn always() -> Self {
        Self::default()
    }

    /// Parse every window value.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, ReplError> {
        let windows = values
            .iter()
            .map(|v| Window::parse(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            windows,
            priority_attrs: Vec::new(),
        })
    }

    /// Attributes whose modification replicates even outside the windows.
    pub fn with_priority_attrs(mut self, attrs: Vec<String>) -> Self {
        self.priority_attrs = attrs.into_iter().map(|a| a.to_ascii_lowercase()).collect();
        self
    }

    /// Attributes that bypass the windows.
    pub fn priority_attrs(&self) -> &[String] {
        &self.priority_attrs
    }

    /// True if there are no windows.
    pub fn is_always(&self) -> bool {
        self.windows.is_empty()
    }

    /// Window values in attribute form.
    pub fn to_values(&self) -> Vec<String> {
        self.windows.iter().map(ToString::to_string).collect()
    }

    /// True if replication may run at `at`.
    pub fn in_window_at(&self, at: NaiveDateTime) -> bool {
        if self.windows.is_empty() {
            return true;
        }
        let (day, minute) = day_and_minute(&at);
        self.windows.iter().any(|w| w.contains(day, minute))
    }

    /// True if a change touching `attrs` may skip the windows.
    pub fn bypasses_window(&self, attrs: &[String]) -> bool {
        attrs
            .iter()
            .any(|a| self.priority_attrs.iter().any(|p| p.eq_ignore_ascii_case(a)))
    }

    /// The next instant at or after `at` when a window is open.
    pub fn next_window_open_at(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.in_window_at(at) {
            return Some(at);
        }
        self.next_change_at(at)
    }

    /// The next minute boundary after `at` where the in-window state flips.
    /// `None` for always-open schedules or schedules that never open.
    pub fn next_change_at(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.windows.is_empty() {
            return None;
        }
        let open = self.in_window_at(at);
        let mut candidate = at.with_second(0)?.with_nanosecond(0)?;
        for _ in 0..(8 * MINUTES_PER_DAY as u32) {
            candidate += ChronoDuration::minutes(1);
            if self.in_window_at(candidate) != open {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2024-01-07 is a Sunday.
    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let w = Window::parse("0800-1730 12345").unwrap();
        assert_eq!(w.to_string(), "0800-1730 12345");
        assert!(Window::parse("0800-1730").is_err());
        assert!(Window::parse("2500-0100 1").is_err());
        assert!(Window::parse("0800-0900 7").is_err());
        let err = Schedule::parse(&["bogus"]).unwrap_err();
        assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
    }

    #[test]
    fn test_weekday_window() {
        let s = Schedule::parse(&["0800-1730 12345"]).unwrap();
        assert!(s.in_window_at(at(8, 9, 0)));
        assert!(!s.in_window_at(at(8, 18, 0)));
        assert!(!s.in_window_at(at(7, 9, 0)));
    }

    #[test]
    fn test_wraps_midnight() {
        let s = Schedule::parse(&["2200-0200 1"]).unwrap();
        assert!(s.in_window_at(at(8, 23, 0)));
        assert!(s.in_window_at(at(9, 1, 0)));
        assert!(!s.in_window_at(at(9, 3, 0)));
        assert!(!s.in_window_at(at(8, 1, 0)));
    }

    #[test]
    fn test_next_open_and_change() {
        let s = Schedule::parse(&["0800-1730 12345"]).unwrap();
        assert_eq!(s.next_window_open_at(at(7, 12, 0)), Some(at(8, 8, 0)));
        assert_eq!(s.next_change_at(at(8, 9, 0)), Some(at(8, 17, 30)));
        assert_eq!(Schedule::always().next_change_at(at(8, 9, 0)), None);
    }

    #[test]
    fn test_priority_attrs() {
        let s = Schedule::parse(&["0800-0900 1"])
            .unwrap()
            .with_priority_attrs(vec!["userPassword".to_string()]);
        assert!(s.bypasses_window(&["userpassword".to_string()]));
        assert!(!s.bypasses_window(&["sn".to_string()]));
    }
}
