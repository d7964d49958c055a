//! Linear interpolation of counter curves onto bucket boundaries.

use super::counter::CounterCurve;
use chrono::{DateTime, Utc};

fn seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// Piecewise-linear counter value at each instant of `at`.
///
/// Instants before the first or after the last sample take the first or last
/// value. On duplicate sample timestamps the first sample wins. An empty
/// curve reads as zero everywhere.
pub fn interpolate(curve: &CounterCurve, at: &[DateTime<Utc>]) -> Vec<f64> {
    let ts = &curve.timestamps;
    let vs = &curve.values;
    if ts.is_empty() {
        return vec![0.0; at.len()];
    }
    let last = ts.len() - 1;

    at.iter()
        .map(|x| {
            if *x <= ts[0] {
                return vs[0];
            }
            if *x >= ts[last] {
                // first sample carrying the final timestamp
                let i = ts.partition_point(|t| t < x);
                return vs[i.min(last)];
            }
            let i = ts.partition_point(|t| t < x);
            if ts[i] == *x {
                return vs[i];
            }
            let (t0, t1) = (seconds(&ts[i - 1]), seconds(&ts[i]));
            let (v0, v1) = (vs[i - 1], vs[i]);
            v0 + (v1 - v0) * (seconds(x) - t0) / (t1 - t0)
        })
        .collect()
}

/// Per-bucket consumption: the difference of the interpolated counter at both
/// ends of each bucket. Yields `buckets.len() - 1` values, all zero when the
/// curve has fewer than two samples.
pub fn resample_deltas(curve: &CounterCurve, buckets: &[DateTime<Utc>]) -> Vec<f64> {
    if buckets.len() < 2 {
        return Vec::new();
    }
    if curve.len() < 2 {
        return vec![0.0; buckets.len() - 1];
    }
    let sampled = interpolate(curve, buckets);
    sampled.windows(2).map(|w| w[1] - w[0]).collect()
}
