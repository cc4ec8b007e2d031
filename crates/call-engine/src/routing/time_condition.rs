//! Time-of-day / day-of-week conditions on routing rules.
//!
//! Grammar (case-insensitive, whitespace separated):
//!
//! ```text
//! condition := [days] [window]          -- at least one part
//! days      := "daily" | "weekdays" | "weekends" | day-list
//! day-list  := day-item ("," day-item)*
//! day-item  := day | day "-" day        -- ranges may wrap, e.g. fri-mon
//! day       := mon | tue | ... | sun    -- full names accepted too
//! window    := HH:MM "-" HH:MM          -- end exclusive, may cross midnight
//! ```
//!
//! For a window crossing midnight the early-morning part belongs to the day
//! the window opened on: `fri 22:00-06:00` holds on Saturday at 02:00.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use crate::error::{CallEngineError, Result};

const ALL_DAYS: u8 = 0b0111_1111;
const WEEKDAYS: u8 = 0b0001_1111;
const WEEKENDS: u8 = 0b0110_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCondition {
    days: u8,
    window: Option<(NaiveTime, NaiveTime)>,
}

impl TimeCondition {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |why: &str| CallEngineError::validation(format!("time condition {input:?}: {why}"));

        let mut window = None;
        let mut day_parts = Vec::new();
        for token in input.split_whitespace() {
            if token.contains(':') {
                if window.is_some() {
                    return Err(invalid("more than one time window"));
                }
                window = Some(parse_window(token).ok_or_else(|| invalid("bad HH:MM-HH:MM window"))?);
            } else {
                day_parts.push(token.to_ascii_lowercase());
            }
        }

        if window.is_none() && day_parts.is_empty() {
            return Err(invalid("empty"));
        }

        let days = if day_parts.is_empty() {
            ALL_DAYS
        } else {
            parse_days(&day_parts.join(",")).ok_or_else(|| invalid("unknown day specification"))?
        };

        Ok(Self { days, window })
    }

    /// Whether the condition holds at the given local wall-clock time.
    pub fn holds_at(&self, now: NaiveDateTime) -> bool {
        let today = now.weekday();
        let time = now.time();

        match self.window {
            None => self.on_day(today),
            Some((start, end)) if start < end => self.on_day(today) && time >= start && time < end,
            Some((start, end)) => {
                let yesterday = (now - Duration::days(1)).weekday();
                (time >= start && self.on_day(today)) || (time < end && self.on_day(yesterday))
            }
        }
    }

    fn on_day(&self, day: Weekday) -> bool {
        self.days & day_bit(day) != 0
    }
}

fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

fn parse_window(token: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start, end) = token.split_once('-')?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    if start == end {
        return None;
    }
    Some((start, end))
}

fn parse_days(spec: &str) -> Option<u8> {
    let mut mask = 0u8;
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        mask |= match item {
            "daily" | "everyday" => ALL_DAYS,
            "weekdays" => WEEKDAYS,
            "weekends" => WEEKENDS,
            _ => match item.split_once('-') {
                Some((from, to)) => day_range(parse_day(from)?, parse_day(to)?),
                None => day_bit(parse_day(item)?),
            },
        };
    }
    (mask != 0).then_some(mask)
}

fn day_range(from: Weekday, to: Weekday) -> u8 {
    let mut mask = 0;
    let mut day = from;
    loop {
        mask |= day_bit(day);
        if day == to {
            return mask;
        }
        day = day.succ();
    }
}

fn parse_day(name: &str) -> Option<Weekday> {
    let day = match name.trim() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}
