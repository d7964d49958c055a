pub mod energy;
pub mod interval;
pub mod meter;
pub mod point;

pub use energy::{CachedDelta, EnergySeries};
pub use interval::{CalculationInterval, IntervalLength, IntervalSpec};
pub use meter::{CountingMode, EnergyMeter, Reading};
pub use point::{MeteringPoint, PointRef, VirtualMeteringPoint};
