use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;

/// Date on a CF calendar, possibly a non-Gregorian one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 1-based ordinal day within the year of its own calendar
    pub day_of_year: u16,
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl CalendarDate {
    fn from_naive(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            day_of_year: dt.ordinal() as u16,
        }
    }

    /// Zero-based month index (January = 0)
    pub fn month_index(&self) -> usize {
        (self.month as usize).saturating_sub(1)
    }
}

/// Unit of a CF time offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
            TimeUnit::Days => 86400.0,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(TimeUnit::Seconds),
            "min" | "mins" | "minute" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(TimeUnit::Hours),
            "d" | "day" | "days" => Ok(TimeUnit::Days),
            other => Err(format!("Unsupported time unit: {}", other)),
        }
    }
}

/// CF calendars understood by the time decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Calendar {
    #[default]
    Standard,
    NoLeap,
    Day360,
}

impl FromStr for Calendar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "gregorian" | "proleptic_gregorian" => Ok(Calendar::Standard),
            "noleap" | "no_leap" | "365_day" => Ok(Calendar::NoLeap),
            "360_day" => Ok(Calendar::Day360),
            other => Err(format!("Unsupported calendar: {}", other)),
        }
    }
}

const NOLEAP_CUMULATIVE_DAYS: [u32; 13] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];

/// Parse CF time units of the form "<unit> since <reference date>"
pub fn parse_time_units(units: &str) -> Result<(TimeUnit, NaiveDateTime), String> {
    let mut parts = units.trim().splitn(2, " since ");
    let unit = parts
        .next()
        .ok_or_else(|| format!("Invalid time units: {}", units))?
        .trim()
        .parse::<TimeUnit>()?;
    let reference = parts
        .next()
        .ok_or_else(|| format!("Time units lack a reference date: {}", units))?;

    Ok((unit, parse_reference_date(reference)?))
}

fn parse_reference_date(text: &str) -> Result<NaiveDateTime, String> {
    let cleaned = text
        .trim()
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim_end_matches("+00:00")
        .trim();

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, format) {
            return Ok(dt);
        }
    }

    NaiveDate::parse_from_str(cleaned, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("Could not parse reference date: {}", text))
}

/// Decode CF time offsets into calendar dates
pub fn decode_cf_times(values: &[f64], units: &str, calendar: Calendar) -> Result<Vec<CalendarDate>, String> {
    let (unit, reference) = parse_time_units(units)?;

    values
        .iter()
        .map(|&value| {
            if !value.is_finite() {
                return Err(format!("Non-finite time value: {}", value));
            }
            let offset_seconds = value * unit.seconds();
            match calendar {
                Calendar::Standard => {
                    let millis = (offset_seconds * 1000.0).round() as i64;
                    let dt = reference
                        .checked_add_signed(Duration::milliseconds(millis))
                        .ok_or_else(|| format!("Time value out of range: {}", value))?;
                    Ok(CalendarDate::from_naive(&dt))
                }
                Calendar::NoLeap | Calendar::Day360 => {
                    Ok(fixed_length_date(&reference, offset_seconds, calendar))
                }
            }
        })
        .collect()
}

/// Date arithmetic for calendars whose years all have the same length
fn fixed_length_date(reference: &NaiveDateTime, offset_seconds: f64, calendar: Calendar) -> CalendarDate {
    let year_length = match calendar {
        Calendar::Day360 => 360.0,
        _ => 365.0,
    };
    let reference_doy = match calendar {
        Calendar::Day360 => (reference.month() - 1) * 30 + reference.day().min(30),
        _ => {
            // Feb 29 does not exist on a no-leap calendar
            let day = if reference.month() == 2 { reference.day().min(28) } else { reference.day() };
            NOLEAP_CUMULATIVE_DAYS[(reference.month() - 1) as usize] + day
        }
    };
    let reference_seconds = reference.num_seconds_from_midnight() as f64;

    let total_days = reference.year() as f64 * year_length
        + (reference_doy - 1) as f64
        + (reference_seconds + offset_seconds) / 86400.0;

    let year = (total_days / year_length).floor();
    let in_year = total_days - year * year_length;
    let doy0 = in_year.floor() as u32;
    let seconds = ((in_year - doy0 as f64) * 86400.0).round() as u32;
    let (doy0, seconds) = if seconds >= 86400 { (doy0 + 1, 0) } else { (doy0, seconds) };

    let (month, day) = match calendar {
        Calendar::Day360 => (doy0 / 30 + 1, doy0 % 30 + 1),
        _ => {
            let month = NOLEAP_CUMULATIVE_DAYS
                .iter()
                .rposition(|&start| start <= doy0)
                .unwrap_or(0)
                .min(11);
            (month as u32 + 1, doy0 - NOLEAP_CUMULATIVE_DAYS[month] + 1)
        }
    };

    CalendarDate {
        year: year as i32,
        month: month as u8,
        day: day as u8,
        hour: (seconds / 3600) as u8,
        minute: ((seconds % 3600) / 60) as u8,
        second: (seconds % 60) as u8,
        day_of_year: (doy0 + 1) as u16,
    }
}

/// Observation time stored as days since 1900-01-01
pub fn days_since_1900(days: f64) -> Option<CalendarDate> {
    let reference = NaiveDate::from_ymd_opt(1900, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let dt = reference.checked_add_signed(Duration::seconds((days * 86400.0).round() as i64))?;
    Some(CalendarDate::from_naive(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_with_fraction_and_zone() {
        let (unit, reference) = parse_time_units("hours since 1970-01-01T00:00:00.0Z").unwrap();
        assert_eq!(unit, TimeUnit::Hours);
        assert_eq!(reference.year(), 1970);
    }

    #[test]
    fn test_noleap_wraps_year() {
        let dates = decode_cf_times(&[364.0, 365.0], "days since 2001-01-01", Calendar::NoLeap).unwrap();
        assert_eq!((dates[0].month, dates[0].day, dates[0].day_of_year), (12, 31, 365));
        assert_eq!((dates[1].year, dates[1].month, dates[1].day), (2002, 1, 1));
    }
}
