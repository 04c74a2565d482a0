//! Rule data model and validation
//!
//! Rules come from the JSON rules file (historically `channels.json`).
//! Every field is range-checked here so the arithmetic in `solar`, `clock`
//! and `scheduler` never sees out-of-range input.

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::redact;

/// Offset used when a rule omits `offset_minutes` (UTC+3, no DST)
pub const DEFAULT_OFFSET_MINUTES: i32 = 180;

/// Default lead time before sunset
pub const DEFAULT_LEAD_MINUTES: i64 = 60;

/// Largest accepted |offset| (UTC-18:00 ..= UTC+18:00)
pub const MAX_OFFSET_MINUTES: i32 = 18 * 60;

pub const MINUTES_PER_DAY: i64 = 1440;

/// Malformed rule input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule identity is empty")]
    EmptyIdentity,
    #[error("unknown weekday '{0}' (expected SUN, MON, TUE, WED, THU, FRI or SAT)")]
    InvalidWeekday(String),
    #[error("schedule '{0}' is malformed (expected e.g. \"SAT 09:00\")")]
    MalformedSchedule(String),
    #[error("hour {0} out of range 0-23")]
    HourOutOfRange(u32),
    #[error("minute {0} out of range 0-59")]
    MinuteOutOfRange(u32),
    #[error("latitude {0} out of range -90..=90")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range -180..=180")]
    LongitudeOutOfRange(f64),
    #[error("offset {0} minutes out of range (max ±{max})", max = MAX_OFFSET_MINUTES)]
    OffsetOutOfRange(i64),
    #[error("lead time {0} minutes out of range 0..{max}", max = MINUTES_PER_DAY)]
    LeadOutOfRange(i64),
}

/// A point on the Earth's surface, in degrees.
///
/// Only constructed through [`GeoPoint::new`], so both coordinates are
/// always finite and in range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, RuleError> {
        // `contains` is false for NaN, so non-finite input is rejected too
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(RuleError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(RuleError::LongitudeOutOfRange(longitude));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Parse a three-letter weekday token, case-insensitive
pub fn parse_weekday(token: &str) -> Result<Weekday, RuleError> {
    match token.to_ascii_uppercase().as_str() {
        "SUN" => Ok(Weekday::Sun),
        "MON" => Ok(Weekday::Mon),
        "TUE" => Ok(Weekday::Tue),
        "WED" => Ok(Weekday::Wed),
        "THU" => Ok(Weekday::Thu),
        "FRI" => Ok(Weekday::Fri),
        "SAT" => Ok(Weekday::Sat),
        _ => Err(RuleError::InvalidWeekday(token.to_string())),
    }
}

pub fn weekday_token(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "SUN",
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
    }
}

/// Weekly trigger: weekday plus local time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
}

impl Schedule {
    pub fn new(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, RuleError> {
        if hour > 23 {
            return Err(RuleError::HourOutOfRange(hour));
        }
        if minute > 59 {
            return Err(RuleError::MinuteOutOfRange(minute));
        }
        Ok(Self { weekday, hour, minute })
    }

    /// Parse a descriptor such as `"SAT 09:00"`
    pub fn parse(descriptor: &str) -> Result<Self, RuleError> {
        let malformed = || RuleError::MalformedSchedule(descriptor.to_string());

        let mut parts = descriptor.split_whitespace();
        let (day, hm) = match (parts.next(), parts.next(), parts.next()) {
            (Some(day), Some(hm), None) => (day, hm),
            _ => return Err(malformed()),
        };
        let weekday = parse_weekday(day)?;

        let (h, m) = hm.split_once(':').ok_or_else(malformed)?;
        if h.is_empty() || m.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(malformed());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let hour: u32 = h.parse().map_err(|_| malformed())?;
        let minute: u32 = m.parse().map_err(|_| malformed())?;

        Self::new(weekday, hour, minute)
    }

    /// Minutes since local Sunday 00:00
    pub fn week_minutes(&self) -> i64 {
        self.weekday.num_days_from_sunday() as i64 * MINUTES_PER_DAY
            + self.hour as i64 * 60
            + self.minute as i64
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:{:02}", weekday_token(self.weekday), self.hour, self.minute)
    }
}

/// A validated notification rule; immutable for the lifetime of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Opaque destination identity (messaging chat id)
    pub identity: String,
    pub location: GeoPoint,
    pub schedule: Schedule,
    /// Weekday whose sunset is announced
    pub event_weekday: Weekday,
    pub offset_minutes: i32,
    pub lead_minutes: i64,
    pub template: Option<String>,
}

impl Rule {
    pub fn new(
        identity: impl Into<String>,
        location: GeoPoint,
        schedule: Schedule,
        offset_minutes: i64,
    ) -> Result<Self, RuleError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(RuleError::EmptyIdentity);
        }
        if offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() as u64 {
            return Err(RuleError::OffsetOutOfRange(offset_minutes));
        }
        Ok(Self {
            identity,
            location,
            schedule,
            event_weekday: schedule.weekday,
            offset_minutes: offset_minutes as i32,
            lead_minutes: DEFAULT_LEAD_MINUTES,
            template: None,
        })
    }

    pub fn with_lead_minutes(mut self, lead_minutes: i64) -> Result<Self, RuleError> {
        if !(0..MINUTES_PER_DAY).contains(&lead_minutes) {
            return Err(RuleError::LeadOutOfRange(lead_minutes));
        }
        self.lead_minutes = lead_minutes;
        Ok(self)
    }

    pub fn with_event_weekday(mut self, weekday: Weekday) -> Self {
        self.event_weekday = weekday;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Dedupe key: identity + offset + schedule, so editing a rule's
    /// definition never matches a stale cache entry
    pub fn dedupe_key(&self) -> String {
        format!("{}::offset{}::{}", self.identity, self.offset_minutes, self.schedule)
    }
}

/// Destination identity as written in the rules file (string or number)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawIdentity {
    Text(String),
    Number(i64),
}

impl RawIdentity {
    fn into_string(self) -> String {
        match self {
            RawIdentity::Text(s) => s,
            RawIdentity::Number(n) => n.to_string(),
        }
    }
}

/// One entry of the rules file, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub chat_id: RawIdentity,
    pub lat: f64,
    pub lon: f64,
    pub schedule: String,
    #[serde(default)]
    pub offset_minutes: Option<i64>,
    #[serde(default)]
    pub lead_minutes: Option<i64>,
    #[serde(default)]
    pub event_day: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl RuleEntry {
    pub fn into_rule(self) -> Result<Rule, RuleError> {
        let location = GeoPoint::new(self.lat, self.lon)?;
        let schedule = Schedule::parse(&self.schedule)?;
        let offset = self.offset_minutes.unwrap_or(DEFAULT_OFFSET_MINUTES as i64);

        let mut rule = Rule::new(self.chat_id.into_string(), location, schedule, offset)?
            .with_lead_minutes(self.lead_minutes.unwrap_or(DEFAULT_LEAD_MINUTES))?;
        if let Some(day) = self.event_day.as_deref() {
            rule = rule.with_event_weekday(parse_weekday(day.trim())?);
        }
        if let Some(text) = self.text {
            rule = rule.with_template(text);
        }
        Ok(rule)
    }
}

/// Parse rules from JSON text.
///
/// The document must be an array. Entries that fail to deserialize or
/// validate are logged and skipped so one bad rule never blocks the others.
pub fn parse_rules(json: &str) -> Result<Vec<Rule>> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(json).context("Rules file must be a JSON array")?;

    let mut rules = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        let entry: RuleEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping rule #{}: {}", index, e);
                continue;
            }
        };
        match entry.into_rule() {
            Ok(rule) => {
                debug!(
                    "Loaded rule #{} for {} ({})",
                    index,
                    redact::identity(&rule.identity),
                    rule.schedule
                );
                rules.push(rule);
            }
            Err(e) => warn!("Skipping rule #{}: {}", index, e),
        }
    }
    Ok(rules)
}

/// Load and validate the rules file
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file '{}'", path.display()))?;
    parse_rules(&text).with_context(|| format!("Invalid rules file '{}'", path.display()))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Schedule parsing never panics
        #[test]
        fn schedule_parse_never_panics(s in ".*") {
            let _ = Schedule::parse(&s);
        }

        /// Every valid descriptor parses back to the same fields
        #[test]
        fn valid_descriptors_parse(day in 0u32..7, hour in 0u32..24, minute in 0u32..60) {
            let tokens = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
            let descriptor = format!("{} {:02}:{:02}", tokens[day as usize], hour, minute);
            let s = Schedule::parse(&descriptor).unwrap();
            prop_assert_eq!(s.weekday.num_days_from_sunday(), day);
            prop_assert_eq!((s.hour, s.minute), (hour, minute));
            prop_assert!(s.week_minutes() < 7 * MINUTES_PER_DAY);
        }

        /// In-range coordinates are always accepted
        #[test]
        fn in_range_points_accepted(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            prop_assert!(GeoPoint::new(lat, lon).is_ok());
        }
    }
}
