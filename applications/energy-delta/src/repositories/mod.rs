pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgEnergyStore;

use crate::error::AppError;
use crate::models::{
    CachedDelta, CalculationInterval, EnergyMeter, MeteringPoint, PointRef, Reading,
    VirtualMeteringPoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read access to points, meters and readings plus the precalculated deltas.
///
/// Readings are only ever read; the cache rows of one (point, interval) pair
/// are only ever replaced as a whole.
#[async_trait]
pub trait EnergyStore: Send + Sync {
    async fn metering_point(&self, id: i64) -> Result<Option<MeteringPoint>, AppError>;

    async fn metering_points(&self) -> Result<Vec<MeteringPoint>, AppError>;

    async fn virtual_metering_point(&self, id: i64) -> Result<Option<VirtualMeteringPoint>, AppError>;

    async fn virtual_metering_points(&self) -> Result<Vec<VirtualMeteringPoint>, AppError>;

    async fn meters_of_point(&self, point_id: i64) -> Result<Vec<EnergyMeter>, AppError>;

    /// Readings of `meter_id` in `[from, to]` plus the last reading before
    /// `from` and the first one after `to`, ordered by timestamp.
    async fn readings(
        &self,
        meter_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AppError>;

    /// First and last reading instant of `meter_id`.
    async fn reading_bounds(
        &self,
        meter_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, AppError>;

    async fn calculation_intervals(&self) -> Result<Vec<CalculationInterval>, AppError>;

    /// Cached rows of `target` for `interval_id` with bucket end in `[from, to]`.
    async fn cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CachedDelta>, AppError>;

    /// Atomically swap every cached row of (`target`, `interval_id`) for `rows`.
    async fn replace_cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        rows: &[CachedDelta],
    ) -> Result<(), AppError>;
}
