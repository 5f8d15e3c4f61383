//! Sky coordinates and observation times.

use std::ops::Deref;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::Degree;

/// Equatorial position of an object, both axes in degrees.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    pub ra: Degree,
    pub dec: Degree,
}
impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra: Degree::new(ra),
            dec: Degree::new(dec),
        }
    }

    /// Parse right ascension and declination as written in the stars file.
    ///
    /// Sexagesimal values are `H:M:S` for RA (scaled by 15 to degrees) and
    /// `±D:M:S` for DEC. Anything else is decimal degrees, accepting either
    /// `.` or `,` as the decimal separator.
    pub fn parse(ra: &str, dec: &str) -> Result<Self, CoordParseError> {
        let ra = parse_angle(ra, 15.0)?;
        let dec = parse_angle(dec, 1.0)?;
        if !(0.0..=360.0).contains(&ra) {
            return Err(CoordParseError::OutOfRange(ra));
        }
        if !(-90.0..=90.0).contains(&dec) {
            return Err(CoordParseError::OutOfRange(dec));
        }
        Ok(Self::new(ra, dec))
    }
}

fn parse_decimal(s: &str) -> Result<f64, CoordParseError> {
    let s = s.trim();
    s.replace(',', ".")
        .parse::<f64>()
        .map_err(|_| CoordParseError::Invalid(s.to_string()))
}

fn parse_angle(s: &str, sexagesimal_scale: f64) -> Result<f64, CoordParseError> {
    let s = s.trim();
    if !s.contains(':') {
        return parse_decimal(s);
    }

    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(CoordParseError::Invalid(s.to_string()));
    }

    let negative = parts[0].trim_start().starts_with('-');
    let whole = parse_decimal(parts[0])?.abs();
    let minutes = parse_decimal(parts[1])?;
    let seconds = parse_decimal(parts[2])?;

    let value = (whole + minutes / 60.0 + seconds / 3600.0) * sexagesimal_scale;
    Ok(if negative { -value } else { value })
}

#[derive(Error, Debug, PartialEq)]
pub enum CoordParseError {
    #[error("Invalid coordinate value: '{0}'")]
    Invalid(String),
    #[error("Coordinate out of range: {0}")]
    OutOfRange(f64),
}

/// Integer day an observation is attributed to.
///
/// An observing night spanning local midnight belongs to the day it began.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize,
)]
pub struct ObservingDay(i64);
impl ObservingDay {
    pub fn new(day: i64) -> Self {
        Self(day)
    }
    pub fn value(&self) -> i64 {
        self.0
    }
}

/// Fractions are rounded to this many decimals before taking the digit.
const FRACTION_SCALE: f64 = 1e8;

/// Leading decimal digit of a time value, tolerant of binary rounding
/// (`x.3` is stored as `x.2999…`).
fn leading_decimal_digit(time: f64) -> i64 {
    let frac = (time - time.floor()) * FRACTION_SCALE;
    ((frac.round() * 10.0 / FRACTION_SCALE).floor() as i64).min(9)
}

fn night_of(time: f64, threshold: i64) -> ObservingDay {
    let day = time.floor() as i64;
    if leading_decimal_digit(time) <= threshold {
        ObservingDay(day - 1)
    } else {
        ObservingDay(day)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, From)]
pub struct JulianDate(f64);
impl JulianDate {
    /// Julian days start at noon, so `.0`–`.4` is still the previous night.
    pub const NIGHT_THRESHOLD: i64 = 4;

    pub fn new(jd: f64) -> Self {
        Self(jd)
    }

    pub fn observing_day(&self) -> ObservingDay {
        night_of(self.0, Self::NIGHT_THRESHOLD)
    }
}
impl Deref for JulianDate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, From)]
pub struct ModifiedJulianDate(f64);
impl ModifiedJulianDate {
    /// MJD days start at midnight; `.0`–`.5` still counts as the previous night.
    pub const NIGHT_THRESHOLD: i64 = 5;

    pub fn new(mjd: f64) -> Self {
        Self(mjd)
    }

    pub fn observing_day(&self) -> ObservingDay {
        night_of(self.0, Self::NIGHT_THRESHOLD)
    }
}
impl Deref for ModifiedJulianDate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Which convention the measurement times are written in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeScale {
    #[default]
    Julian,
    ModifiedJulian,
}
impl TimeScale {
    pub fn observing_day(&self, time: f64) -> ObservingDay {
        match self {
            TimeScale::Julian => JulianDate::new(time).observing_day(),
            TimeScale::ModifiedJulian => ModifiedJulianDate::new(time).observing_day(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_julian_observing_day() {
        assert_eq!(
            JulianDate::new(2457234.3).observing_day(),
            ObservingDay::new(2457233)
        );
        assert_eq!(
            JulianDate::new(2457234.6).observing_day(),
            ObservingDay::new(2457234)
        );
        assert_eq!(
            JulianDate::new(2457234.4999).observing_day(),
            ObservingDay::new(2457233)
        );
        assert_eq!(
            JulianDate::new(2457234.5).observing_day(),
            ObservingDay::new(2457234)
        );
        assert_eq!(*JulianDate::new(2457234.5), 2457234.5);
    }

    #[test]
    fn test_observing_day_just_below_digit_boundary() {
        assert_eq!(
            JulianDate::new(2457234.49999995).observing_day(),
            ObservingDay::new(2457233)
        );
        assert_eq!(
            ModifiedJulianDate::new(57234.59999995).observing_day(),
            ObservingDay::new(57233)
        );
        assert_eq!(
            JulianDate::new(2457234.999999999).observing_day(),
            ObservingDay::new(2457234)
        );
    }

    #[test]
    fn test_modified_julian_observing_day() {
        assert_eq!(
            ModifiedJulianDate::new(57234.5).observing_day(),
            ObservingDay::new(57233)
        );
        assert_eq!(
            ModifiedJulianDate::new(57234.6).observing_day(),
            ObservingDay::new(57234)
        );
        assert_eq!(
            TimeScale::ModifiedJulian.observing_day(57234.55),
            ObservingDay::new(57233)
        );
        assert_eq!(*ModifiedJulianDate::new(57234.55), 57234.55);
    }

    #[test]
    fn test_parse_decimal_coordinates() {
        let c = SkyCoord::parse("83,8221", "-5.3911").unwrap();
        assert_relative_eq!(c.ra.degrees(), 83.8221, epsilon = 1e-12);
        assert_relative_eq!(c.dec.degrees(), -5.3911, epsilon = 1e-12);
    }

    #[test]
    fn test_parse_sexagesimal_coordinates() {
        let c = SkyCoord::parse("05:35:17.3", "-05:23:28").unwrap();
        assert_relative_eq!(
            c.ra.degrees(),
            (5.0 + 35.0 / 60.0 + 17.3 / 3600.0) * 15.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            c.dec.degrees(),
            -(5.0 + 23.0 / 60.0 + 28.0 / 3600.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SkyCoord::parse("abc", "10"),
            Err(CoordParseError::Invalid(_))
        ));
        assert!(matches!(
            SkyCoord::parse("10", "95"),
            Err(CoordParseError::OutOfRange(_))
        ));
        assert!(SkyCoord::parse("10:20", "10").is_err());
    }
}
