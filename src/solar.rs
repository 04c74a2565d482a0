//! Sunset calculation
//!
//! Low-precision solar position model (mean anomaly, equation of center,
//! declination, hour angle). Accurate to a few minutes at temperate
//! latitudes, which is plenty for a message that rounds to the minute.

use chrono::{DateTime, TimeZone, Utc};
use std::f64::consts::PI;
use thiserror::Error;

use crate::rule::GeoPoint;

const RAD: f64 = PI / 180.0;
const MS_PER_DAY: f64 = 86_400_000.0;

/// Julian date of the Unix epoch (1970-01-01T00:00:00Z)
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Julian date of J2000.0
pub const J2000: f64 = 2_451_545.0;

/// Apparent altitude of the sun's center at sunset (refraction + semi-diameter)
const SUNSET_ALTITUDE_DEG: f64 = -0.83;

/// Obliquity of the ecliptic
const OBLIQUITY_DEG: f64 = 23.4397;

/// Perihelion of the Earth
const PERIHELION_DEG: f64 = 102.9372;

/// Why the sun does not cross the horizon on the requested date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarCondition {
    /// Sun stays above the horizon all day
    PolarDay,
    /// Sun stays below the horizon all day
    PolarNight,
}

impl std::fmt::Display for PolarCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolarCondition::PolarDay => write!(f, "polar day"),
            PolarCondition::PolarNight => write!(f, "polar night"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("no sunset at lat={latitude:.4}, lon={longitude:.4}: {reason}")]
pub struct NoSunsetError {
    pub latitude: f64,
    pub longitude: f64,
    pub reason: PolarCondition,
}

/// Convert an instant to a continuous Julian day number
pub fn to_julian(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64 / MS_PER_DAY + UNIX_EPOCH_JD
}

/// Convert a Julian day number back to an instant (millisecond resolution)
pub fn from_julian(jd: f64) -> Option<DateTime<Utc>> {
    let millis = ((jd - UNIX_EPOCH_JD) * MS_PER_DAY).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn solar_mean_anomaly(d: f64) -> f64 {
    RAD * (357.5291 + 0.98560028 * d)
}

fn ecliptic_longitude(m: f64) -> f64 {
    // equation of center
    let c = RAD * (1.9148 * m.sin() + 0.02 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin());
    m + c + RAD * PERIHELION_DEG + PI
}

fn declination(l: f64) -> f64 {
    ((RAD * OBLIQUITY_DEG).sin() * l.sin()).asin()
}

fn julian_cycle(d: f64, lw: f64) -> f64 {
    (d - 0.0009 - lw / (2.0 * PI)).round()
}

/// Cosine of the sunset hour angle; outside [-1, 1] the sun never crosses `h0`
fn hour_angle_cosine(h0: f64, phi: f64, dec: f64) -> f64 {
    (h0.sin() - phi.sin() * dec.sin()) / (phi.cos() * dec.cos())
}

/// Compute the sunset instant for the solar day containing `anchor`.
///
/// `anchor` only pins the date; pass local noon (see `clock::next_occurrence_anchor`)
/// so the Julian cycle is never ambiguous. Returns [`NoSunsetError`] when the
/// location is in polar day or polar night on that date.
pub fn sunset(anchor: DateTime<Utc>, point: GeoPoint) -> Result<DateTime<Utc>, NoSunsetError> {
    let lw = -point.longitude() * RAD;
    let phi = point.latitude() * RAD;

    let d = to_julian(anchor) - J2000;
    let n = julian_cycle(d, lw);
    let m = solar_mean_anomaly(d);
    let l = ecliptic_longitude(m);
    let dec = declination(l);

    let cos_h = hour_angle_cosine(SUNSET_ALTITUDE_DEG * RAD, phi, dec);
    let no_sunset = |reason| NoSunsetError {
        latitude: point.latitude(),
        longitude: point.longitude(),
        reason,
    };
    // NaN fails both comparisons, so it must be rejected explicitly
    if cos_h.is_nan() {
        return Err(no_sunset(PolarCondition::PolarNight));
    }
    if cos_h < -1.0 {
        return Err(no_sunset(PolarCondition::PolarDay));
    }
    if cos_h > 1.0 {
        return Err(no_sunset(PolarCondition::PolarNight));
    }
    let h = cos_h.acos();

    let approx = 0.0009 + (h + lw) / (2.0 * PI) + n;
    let j_set = J2000 + approx + 0.0053 * m.sin() - 0.0069 * (2.0 * l).sin();

    from_julian(j_set).ok_or_else(|| no_sunset(PolarCondition::PolarNight))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Between the polar circles a sunset always exists
        #[test]
        fn temperate_latitudes_always_have_sunset(
            lat in -60.0f64..60.0,
            lon in -180.0f64..180.0,
            day in 0i64..3650,
        ) {
            let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::days(day);
            let p = GeoPoint::new(lat, lon).unwrap();
            prop_assert!(sunset(anchor, p).is_ok());
        }

        /// Sunset lands within a day of the anchor, never a wrapped-around time
        #[test]
        fn sunset_near_anchor(
            lat in -89.0f64..89.0,
            lon in -180.0f64..180.0,
            day in 0i64..3650,
        ) {
            let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::days(day);
            let p = GeoPoint::new(lat, lon).unwrap();
            if let Ok(set) = sunset(anchor, p) {
                prop_assert!((set - anchor).num_hours().abs() <= 36);
            }
        }

        #[test]
        fn julian_round_trip_to_millisecond(secs in 0i64..4_000_000_000i64) {
            let instant = Utc.timestamp_opt(secs, 0).unwrap();
            let back = from_julian(to_julian(instant)).unwrap();
            prop_assert!((back - instant).num_milliseconds().abs() <= 1);
        }
    }
}
