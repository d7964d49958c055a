//! Turns raw meter readings into a counter curve that can be interpolated.

use crate::models::{CountingMode, EnergyMeter, Reading};
use chrono::{DateTime, Utc};

/// Counter states over time; `timestamps` is non-decreasing and both vectors
/// have equal length. Values are not guaranteed to be monotonic: counter
/// rollovers and meter swaps are passed through as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterCurve {
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl CounterCurve {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Build the counter curve for `meter` from its readings (ordered by time).
///
/// Upcounting readings are taken as they are. Delta readings are summed up,
/// starting at `initial_value` (or 0). A delta meter with `in_operation_from`
/// before its first reading gets a synthetic reading at that instant carrying
/// the start value, so integration begins at a known origin. Every value is
/// finally scaled by `factor`.
pub fn reconstruct(meter: &EnergyMeter, readings: &[Reading]) -> CounterCurve {
    let mut timestamps = Vec::with_capacity(readings.len() + 1);
    let mut values = Vec::with_capacity(readings.len() + 1);

    match meter.counting_mode {
        CountingMode::Upcounting => {
            for r in readings {
                timestamps.push(r.ts);
                values.push(r.value);
            }
        }
        CountingMode::Delta => {
            let mut total = meter.initial_value.unwrap_or(0.0);
            if let Some(origin) = meter.in_operation_from {
                if readings.first().map_or(true, |first| origin < first.ts) {
                    timestamps.push(origin);
                    values.push(total);
                }
            }
            for r in readings {
                total += r.value;
                timestamps.push(r.ts);
                values.push(total);
            }
        }
    }

    for v in &mut values {
        *v *= meter.factor;
    }

    CounterCurve { timestamps, values }
}
