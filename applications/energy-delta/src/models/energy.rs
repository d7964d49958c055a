use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of every public energy query: one value per bucket, stamped with the bucket end.
///
/// An empty pair means "no data" and is never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergySeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl EnergySeries {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pair per-bucket values with the bucket ends of `buckets`.
    pub fn from_buckets(buckets: &[DateTime<Utc>], values: Vec<f64>) -> Self {
        if buckets.len() < 2 {
            return Self::empty();
        }
        debug_assert_eq!(buckets.len() - 1, values.len());
        Self {
            timestamps: buckets[1..].to_vec(),
            values,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn cached_rows(&self) -> Vec<CachedDelta> {
        self.timestamps
            .iter()
            .zip(&self.values)
            .map(|(ts, v)| CachedDelta {
                reading_date: *ts,
                energy_delta: *v,
            })
            .collect()
    }
}

/// One precalculated bucket of a (point, interval) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedDelta {
    /// Bucket end.
    pub reading_date: DateTime<Utc>,
    pub energy_delta: f64,
}
