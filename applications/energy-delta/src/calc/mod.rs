//! The energy delta calculation engine: pure, synchronous building blocks.
//!
//! Nothing in here touches storage. The services layer loads data through
//! [`crate::repositories::EnergyStore`] and hands plain slices to these functions.

pub mod buckets;
pub mod counter;
pub mod dependencies;
pub mod formula;
pub mod graph;
pub mod resample;

pub use buckets::{buckets, period_start};
pub use counter::{reconstruct, CounterCurve};
pub use dependencies::{referenced_point_ids, referenced_virtual_point_ids};
pub use formula::{CalculationError, Expr, Reference};
pub use graph::FormulaGraph;
pub use resample::{interpolate, resample_deltas};
