use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::fmt;

/// A real measurement location. Its consumption is the sum of its meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringPoint {
    pub id: i64,
    pub name: String,
    /// Parent points; attribute inheritance only, never evaluated.
    #[serde(default)]
    pub higher_level_metering_points: Vec<i64>,
}

impl MeteringPoint {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            higher_level_metering_points: Vec::new(),
        }
    }
}

impl<'r> FromRow<'r, PgRow> for MeteringPoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            higher_level_metering_points: row
                .try_get::<Option<Vec<i64>>, _>("higher_level_metering_points")?
                .unwrap_or_default(),
        })
    }
}

/// A formula-defined point, e.g. `mp(3) - vmp(7) * 0.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMeteringPoint {
    pub id: i64,
    pub name: String,
    pub calculation: String,
    /// Not evaluated.
    #[serde(default)]
    pub weather_adjustment_id: Option<i64>,
}

impl VirtualMeteringPoint {
    pub fn new(id: i64, name: impl Into<String>, calculation: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            calculation: calculation.into(),
            weather_adjustment_id: None,
        }
    }
}

impl<'r> FromRow<'r, PgRow> for VirtualMeteringPoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            calculation: row.try_get("calculation")?,
            weather_adjustment_id: row.try_get("weather_adjustment_id")?,
        })
    }
}

/// Identifies either kind of point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PointRef {
    Metering(i64),
    Virtual(i64),
}

impl PointRef {
    pub fn id(&self) -> i64 {
        match self {
            PointRef::Metering(id) | PointRef::Virtual(id) => *id,
        }
    }
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointRef::Metering(id) => write!(f, "mp({id})"),
            PointRef::Virtual(id) => write!(f, "vmp({id})"),
        }
    }
}
