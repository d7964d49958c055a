pub mod energy;
pub mod precalc;

pub use energy::{EnergyService, UsedVariables};
pub use precalc::{PrecalculationCache, RecomputeScope, RecomputeSummary, Sweep, SweepProgress};
