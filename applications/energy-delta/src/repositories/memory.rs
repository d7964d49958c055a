use super::EnergyStore;
use crate::error::AppError;
use crate::models::{
    CachedDelta, CalculationInterval, EnergyMeter, MeteringPoint, PointRef, Reading,
    VirtualMeteringPoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    points: BTreeMap<i64, MeteringPoint>,
    virtual_points: BTreeMap<i64, VirtualMeteringPoint>,
    meters: BTreeMap<i64, EnergyMeter>,
    readings: HashMap<i64, Vec<Reading>>,
    intervals: BTreeMap<i32, CalculationInterval>,
    cache: HashMap<(PointRef, i32), Vec<CachedDelta>>,
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_metering_point(&self, point: MeteringPoint) {
        self.state.write().await.points.insert(point.id, point);
    }

    pub async fn insert_virtual_metering_point(&self, point: VirtualMeteringPoint) {
        self.state.write().await.virtual_points.insert(point.id, point);
    }

    pub async fn insert_meter(&self, meter: EnergyMeter) {
        self.state.write().await.meters.insert(meter.id, meter);
    }

    /// Append readings; stored order is by timestamp, ties keep insertion order.
    pub async fn insert_readings(&self, meter_id: i64, readings: impl IntoIterator<Item = Reading>) {
        let mut state = self.state.write().await;
        let series = state.readings.entry(meter_id).or_default();
        series.extend(readings);
        series.sort_by_key(|r| r.ts);
    }

    pub async fn insert_interval(&self, interval: CalculationInterval) {
        self.state.write().await.intervals.insert(interval.id, interval);
    }

    /// Every cached row of (`target`, `interval_id`), ordered by bucket end.
    pub async fn all_cached_deltas(&self, target: PointRef, interval_id: i32) -> Vec<CachedDelta> {
        self.state
            .read()
            .await
            .cache
            .get(&(target, interval_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EnergyStore for MemoryStore {
    async fn metering_point(&self, id: i64) -> Result<Option<MeteringPoint>, AppError> {
        Ok(self.state.read().await.points.get(&id).cloned())
    }

    async fn metering_points(&self) -> Result<Vec<MeteringPoint>, AppError> {
        Ok(self.state.read().await.points.values().cloned().collect())
    }

    async fn virtual_metering_point(&self, id: i64) -> Result<Option<VirtualMeteringPoint>, AppError> {
        Ok(self.state.read().await.virtual_points.get(&id).cloned())
    }

    async fn virtual_metering_points(&self) -> Result<Vec<VirtualMeteringPoint>, AppError> {
        Ok(self.state.read().await.virtual_points.values().cloned().collect())
    }

    async fn meters_of_point(&self, point_id: i64) -> Result<Vec<EnergyMeter>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .meters
            .values()
            .filter(|m| m.metering_point_id == Some(point_id))
            .cloned()
            .collect())
    }

    async fn readings(
        &self,
        meter_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AppError> {
        let state = self.state.read().await;
        let Some(all) = state.readings.get(&meter_id) else {
            return Ok(Vec::new());
        };

        let lo = all.partition_point(|r| r.ts < from);
        let hi = all.partition_point(|r| r.ts <= to);
        // one bracketing reading on each side
        let mut out: Vec<Reading> = Vec::with_capacity(hi - lo + 2);
        if lo > 0 {
            out.push(all[lo - 1]);
        }
        out.extend_from_slice(&all[lo..hi]);
        if hi < all.len() {
            out.push(all[hi]);
        }
        Ok(out)
    }

    async fn reading_bounds(
        &self,
        meter_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .readings
            .get(&meter_id)
            .and_then(|all| Some((all.first()?.ts, all.last()?.ts))))
    }

    async fn calculation_intervals(&self) -> Result<Vec<CalculationInterval>, AppError> {
        Ok(self.state.read().await.intervals.values().cloned().collect())
    }

    async fn cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CachedDelta>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .cache
            .get(&(target, interval_id))
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.reading_date >= from && r.reading_date <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        rows: &[CachedDelta],
    ) -> Result<(), AppError> {
        let mut sorted = rows.to_vec();
        sorted.sort_by_key(|r| r.reading_date);
        self.state.write().await.cache.insert((target, interval_id), sorted);
        Ok(())
    }
}
