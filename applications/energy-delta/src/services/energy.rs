//! Energy queries for metering points and virtual metering points.
//!
//! Everything the calculation needs is loaded through the store first; the
//! numeric work then runs synchronously on the loaded data.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::calc::{self, FormulaGraph};
use crate::error::{AppError, CalculationSyntaxError, Result};
use crate::models::{
    EnergyMeter, EnergySeries, IntervalSpec, MeteringPoint, PointRef, VirtualMeteringPoint,
};
use crate::repositories::EnergyStore;

#[derive(Clone)]
pub struct EnergyService {
    store: Arc<dyn EnergyStore>,
    timezone: Tz,
}

/// Existing points a calculation refers to directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsedVariables {
    pub metering_points: Vec<MeteringPoint>,
    pub virtual_metering_points: Vec<VirtualMeteringPoint>,
}

impl fmt::Display for UsedVariables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MeteringPoints:")?;
        for mp in &self.metering_points {
            writeln!(f, "{}: {}", mp.id, mp.name)?;
        }
        writeln!(f, "VirtualMeteringPoints:")?;
        for vmp in &self.virtual_metering_points {
            writeln!(f, "{}: {}", vmp.id, vmp.name)?;
        }
        Ok(())
    }
}

fn widen(
    acc: Option<(DateTime<Utc>, DateTime<Utc>)>,
    next: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match (acc, next) {
        (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
        (a, b) => a.or(b),
    }
}

impl EnergyService {
    pub fn new(store: Arc<dyn EnergyStore>, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    pub fn store(&self) -> &Arc<dyn EnergyStore> {
        &self.store
    }

    /// Timezone used for calculation intervals that do not name their own.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Per-bucket energy of `target` over `[start, end]`, stamped with bucket ends.
    ///
    /// An empty range gives an empty series. With `use_precalculated` the
    /// values come from the cache of the matching registered interval and
    /// buckets without a cached row read as zero.
    pub async fn energy_data(
        &self,
        target: PointRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        spec: &IntervalSpec,
        use_precalculated: bool,
    ) -> Result<EnergySeries> {
        self.ensure_exists(target).await?;

        let buckets = calc::buckets(start, end, spec);
        if buckets.len() < 2 {
            debug!(point = %target, %start, %end, interval = %spec, "No buckets in range");
            return Ok(EnergySeries::empty());
        }

        let values = if use_precalculated {
            self.precalculated_deltas(target, &buckets, spec).await?
        } else {
            match target {
                PointRef::Metering(id) => self.point_deltas(id, &buckets).await?,
                PointRef::Virtual(id) => self.virtual_point_deltas(id, &buckets).await?,
            }
        };

        debug!(point = %target, buckets = values.len(), interval = %spec, "Computed energy data");
        Ok(EnergySeries::from_buckets(&buckets, values))
    }

    async fn ensure_exists(&self, target: PointRef) -> Result<()> {
        let found = match target {
            PointRef::Metering(id) => self.store.metering_point(id).await?.is_some(),
            PointRef::Virtual(id) => self.store.virtual_metering_point(id).await?.is_some(),
        };
        if found {
            Ok(())
        } else {
            Err(AppError::NotFound(target.to_string()))
        }
    }

    /// Sum of the resampled deltas of every meter of `point_id`.
    pub async fn point_deltas(&self, point_id: i64, buckets: &[DateTime<Utc>]) -> Result<Vec<f64>> {
        let bucket_count = buckets.len().saturating_sub(1);
        let mut total = vec![0.0; bucket_count];
        if bucket_count == 0 {
            return Ok(total);
        }

        let meters = self.store.meters_of_point(point_id).await?;
        for meter in &meters {
            let deltas = match self.meter_deltas(meter, buckets).await {
                Ok(deltas) => deltas,
                Err(e) => {
                    warn!(point = point_id, meter = meter.id, error = %e, "Meter data unavailable, using zeros");
                    continue;
                }
            };
            for (acc, d) in total.iter_mut().zip(deltas) {
                *acc += d;
            }
        }
        Ok(total)
    }

    async fn meter_deltas(&self, meter: &EnergyMeter, buckets: &[DateTime<Utc>]) -> Result<Vec<f64>> {
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            return Ok(Vec::new());
        };
        let readings = self.store.readings(meter.id, *first, *last).await?;
        let curve = calc::reconstruct(meter, &readings);
        Ok(calc::resample_deltas(&curve, buckets))
    }

    /// Evaluate the calculation of virtual point `id` over `buckets`.
    pub async fn virtual_point_deltas(&self, id: i64, buckets: &[DateTime<Utc>]) -> Result<Vec<f64>> {
        let bucket_count = buckets.len().saturating_sub(1);
        let Some(vmp) = self.store.virtual_metering_point(id).await? else {
            warn!(virtual_point = id, "Virtual metering point not found, using zeros");
            return Ok(vec![0.0; bucket_count]);
        };

        let graph = self.load_graph(Some(id), &vmp.calculation).await?;
        let mut series = HashMap::new();
        for point_id in graph.referenced_points() {
            if graph.contains_point(point_id) {
                series.insert(point_id, self.point_deltas(point_id, buckets).await?);
            }
        }
        Ok(graph.evaluate(id, bucket_count, &series))
    }

    /// Load `calculation` and every calculation reachable from it.
    ///
    /// `root` is registered with `calculation` itself, so a reference back to
    /// the point under edit sees the new text.
    async fn load_graph(&self, root: Option<i64>, calculation: &str) -> Result<FormulaGraph> {
        let mut graph = FormulaGraph::new();
        let mut seen_points = HashSet::new();
        let mut seen_virtual = HashSet::new();
        let mut pending = vec![calculation.to_string()];

        if let Some(id) = root {
            graph.insert_virtual_point(id, calculation);
            seen_virtual.insert(id);
        }

        while let Some(calc_text) = pending.pop() {
            for mp in calc::referenced_point_ids(&calc_text) {
                if seen_points.insert(mp) && self.store.metering_point(mp).await?.is_some() {
                    graph.insert_point(mp);
                }
            }
            for vmp in calc::referenced_virtual_point_ids(&calc_text) {
                if !seen_virtual.insert(vmp) {
                    continue;
                }
                if let Some(found) = self.store.virtual_metering_point(vmp).await? {
                    graph.insert_virtual_point(vmp, found.calculation.clone());
                    pending.push(found.calculation);
                }
            }
        }
        Ok(graph)
    }

    /// Validate `calculation` for editing, optionally as the formula of
    /// `virtual_point`. Fails with [`AppError::CalculationSyntax`].
    pub async fn check_calculation(&self, calculation: &str, virtual_point: Option<i64>) -> Result<()> {
        let graph = self.load_graph(virtual_point, calculation).await?;
        graph.validate(calculation, virtual_point).map_err(|reason| {
            AppError::from(CalculationSyntaxError {
                formula: calculation.to_string(),
                virtual_point,
                reason,
            })
        })
    }

    /// Points `calculation` references directly, skipping ids that do not exist.
    pub async fn used_variables(&self, calculation: &str) -> Result<UsedVariables> {
        let mut used = UsedVariables::default();
        for id in calc::referenced_point_ids(calculation) {
            if let Some(mp) = self.store.metering_point(id).await? {
                used.metering_points.push(mp);
            }
        }
        for id in calc::referenced_virtual_point_ids(calculation) {
            if let Some(vmp) = self.store.virtual_metering_point(id).await? {
                used.virtual_metering_points.push(vmp);
            }
        }
        Ok(used)
    }

    /// Earliest and latest instant with underlying data, `None` without data.
    ///
    /// The origin of a delta meter counts as data. Virtual points span every
    /// metering point reachable through their calculation.
    pub async fn data_horizon(&self, target: PointRef) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        match target {
            PointRef::Metering(id) => self.point_horizon(id).await,
            PointRef::Virtual(id) => {
                let Some(vmp) = self.store.virtual_metering_point(id).await? else {
                    return Ok(None);
                };
                let graph = self.load_graph(Some(id), &vmp.calculation).await?;
                let points: BTreeSet<i64> = graph
                    .referenced_points()
                    .into_iter()
                    .filter(|mp| graph.contains_point(*mp))
                    .collect();

                let mut horizon = None;
                for point_id in points {
                    horizon = widen(horizon, self.point_horizon(point_id).await?);
                }
                Ok(horizon)
            }
        }
    }

    async fn point_horizon(&self, point_id: i64) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let mut horizon = None;
        for meter in self.store.meters_of_point(point_id).await? {
            horizon = widen(horizon, self.store.reading_bounds(meter.id).await?);
            if let Some(origin) = meter.synthetic_origin() {
                horizon = widen(horizon, Some((origin, origin)));
            }
        }
        Ok(horizon)
    }

    async fn precalculated_deltas(
        &self,
        target: PointRef,
        buckets: &[DateTime<Utc>],
        spec: &IntervalSpec,
    ) -> Result<Vec<f64>> {
        let ends = &buckets[1..];
        let intervals = self.store.calculation_intervals().await?;
        let Some(interval) = intervals.iter().find(|i| i.matches(spec, self.timezone)) else {
            warn!(point = %target, interval = %spec, "No registered calculation interval, using zeros");
            return Ok(vec![0.0; ends.len()]);
        };

        let (Some(first), Some(last)) = (ends.first(), ends.last()) else {
            return Ok(Vec::new());
        };
        let rows = self.store.cached_deltas(target, interval.id, *first, *last).await?;
        let cached: HashMap<DateTime<Utc>, f64> =
            rows.into_iter().map(|r| (r.reading_date, r.energy_delta)).collect();

        Ok(ends.iter().map(|ts| cached.get(ts).copied().unwrap_or(0.0)).collect())
    }
}
