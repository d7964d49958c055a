use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// How the raw values of a meter have to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    /// Raw values are absolute counter states.
    #[default]
    Upcounting,
    /// Raw values are increments since the previous reading.
    Delta,
}

impl fmt::Display for CountingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountingMode::Upcounting => f.write_str("upcounting"),
            CountingMode::Delta => f.write_str("delta"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown counting mode: {0}")]
pub struct UnknownCountingMode(pub String);

impl FromStr for CountingMode {
    type Err = UnknownCountingMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "upcounting" | "up" => Ok(CountingMode::Upcounting),
            "delta" => Ok(CountingMode::Delta),
            other => Err(UnknownCountingMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyMeter {
    pub id: i64,
    pub metering_point_id: Option<i64>,
    pub counting_mode: CountingMode,
    pub factor: f64,
    pub initial_value: Option<f64>,
    pub in_operation_from: Option<DateTime<Utc>>,
    pub in_operation_to: Option<DateTime<Utc>>,
}

impl EnergyMeter {
    /// Upcounting meter with factor 1 attached to `metering_point_id`.
    pub fn new(id: i64, metering_point_id: i64) -> Self {
        Self {
            id,
            metering_point_id: Some(metering_point_id),
            counting_mode: CountingMode::Upcounting,
            factor: 1.0,
            initial_value: None,
            in_operation_from: None,
            in_operation_to: None,
        }
    }

    /// Instant of the implicit zero reading, if this meter integrates deltas from a known origin.
    pub fn synthetic_origin(&self) -> Option<DateTime<Utc>> {
        match self.counting_mode {
            CountingMode::Delta => self.in_operation_from,
            CountingMode::Upcounting => None,
        }
    }
}

impl<'r> FromRow<'r, PgRow> for EnergyMeter {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let mode: String = row.try_get("counting_mode")?;
        let counting_mode = mode.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "counting_mode".into(),
            source: Box::new(e),
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            metering_point_id: row.try_get("metering_point_id")?,
            counting_mode,
            factor: row.try_get("factor")?,
            initial_value: row.try_get("initial_value")?,
            in_operation_from: row.try_get("in_operation_from")?,
            in_operation_to: row.try_get("in_operation_to")?,
        })
    }
}

/// One raw meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

impl Reading {
    pub fn new(ts: DateTime<Utc>, value: f64) -> Self {
        Self { ts, value }
    }
}

impl<'r> FromRow<'r, PgRow> for Reading {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            ts: row.try_get("reading_date")?,
            value: row.try_get("reading")?,
        })
    }
}
