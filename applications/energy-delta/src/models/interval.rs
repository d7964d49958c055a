use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Bucket granularity as stored in `calculation_interval.interval_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IntervalLength {
    Seconds(u64),
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl IntervalLength {
    /// Fixed bucket width in seconds. `hour`, `day` and `week` are fixed on purpose.
    pub fn fixed_seconds(&self) -> Option<u64> {
        match self {
            IntervalLength::Seconds(s) => Some(*s),
            IntervalLength::Hour => Some(3_600),
            IntervalLength::Day => Some(86_400),
            IntervalLength::Week => Some(604_800),
            IntervalLength::Month | IntervalLength::Quarter | IntervalLength::Year => None,
        }
    }

    /// Calendar step in months for `month`, `quarter` and `year`.
    pub fn calendar_months(&self) -> Option<u32> {
        match self {
            IntervalLength::Month => Some(1),
            IntervalLength::Quarter => Some(3),
            IntervalLength::Year => Some(12),
            _ => None,
        }
    }
}

impl fmt::Display for IntervalLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalLength::Seconds(s) => write!(f, "{s}"),
            IntervalLength::Hour => f.write_str("hour"),
            IntervalLength::Day => f.write_str("day"),
            IntervalLength::Week => f.write_str("week"),
            IntervalLength::Month => f.write_str("month"),
            IntervalLength::Quarter => f.write_str("quarter"),
            IntervalLength::Year => f.write_str("year"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid interval length '{0}': expected hour, day, week, month, quarter, year or a number of seconds")]
pub struct InvalidIntervalLength(pub String);

impl FromStr for IntervalLength {
    type Err = InvalidIntervalLength;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        match raw.to_lowercase().as_str() {
            "hour" => return Ok(IntervalLength::Hour),
            "day" => return Ok(IntervalLength::Day),
            "week" => return Ok(IntervalLength::Week),
            "month" => return Ok(IntervalLength::Month),
            // legacy spelling still present in stored intervals
            "quarter" | "quater" => return Ok(IntervalLength::Quarter),
            "year" => return Ok(IntervalLength::Year),
            _ => {}
        }
        if let Ok(secs) = raw.parse::<u64>() {
            return Ok(IntervalLength::Seconds(secs));
        }
        match raw.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 && secs.fract() == 0.0 => {
                Ok(IntervalLength::Seconds(secs as u64))
            }
            _ => Err(InvalidIntervalLength(s.to_string())),
        }
    }
}

impl TryFrom<String> for IntervalLength {
    type Error = InvalidIntervalLength;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IntervalLength> for String {
    fn from(value: IntervalLength) -> Self {
        value.to_string()
    }
}

/// Interval length plus the timezone that anchors calendar buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSpec {
    pub length: IntervalLength,
    pub timezone: Tz,
}

impl IntervalSpec {
    pub fn new(length: IntervalLength, timezone: Tz) -> Self {
        Self { length, timezone }
    }

    /// Parse an interval identifier and an IANA timezone name.
    pub fn parse(length: &str, timezone: &str) -> Result<Self, crate::error::AppError> {
        let length = length
            .parse()
            .map_err(|e: InvalidIntervalLength| crate::error::AppError::Validation(e.to_string()))?;
        let timezone = parse_timezone(timezone)?;
        Ok(Self { length, timezone })
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.length, self.timezone)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, crate::error::AppError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| crate::error::AppError::Validation(format!("unknown timezone: {name}")))
}

/// A registered interval; cached deltas are keyed by its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationInterval {
    pub id: i32,
    pub length: IntervalLength,
    /// Falls back to the configured calculation timezone when unset.
    pub timezone: Option<Tz>,
}

impl CalculationInterval {
    pub fn spec(&self, default_timezone: Tz) -> IntervalSpec {
        IntervalSpec::new(self.length, self.timezone.unwrap_or(default_timezone))
    }

    /// Fixed-width buckets do not depend on the timezone, so only calendar
    /// lengths compare it.
    pub fn matches(&self, spec: &IntervalSpec, default_timezone: Tz) -> bool {
        let own = self.spec(default_timezone);
        own.length == spec.length
            && (own.length.calendar_months().is_none() || own.timezone == spec.timezone)
    }
}

impl<'r> FromRow<'r, PgRow> for CalculationInterval {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let length: String = row.try_get("interval_length")?;
        let length = length.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "interval_length".into(),
            source: Box::new(e),
        })?;
        let timezone: Option<String> = row.try_get("timezone")?;
        let timezone = match timezone.filter(|tz| !tz.trim().is_empty()) {
            Some(name) => Some(name.trim().parse::<Tz>().map_err(|_| sqlx::Error::ColumnDecode {
                index: "timezone".into(),
                source: format!("unknown timezone: {name}").into(),
            })?),
            None => None,
        };
        Ok(Self {
            id: row.try_get("id")?,
            length,
            timezone,
        })
    }
}
