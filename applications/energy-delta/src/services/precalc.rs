//! Precalculation cache maintenance.
//!
//! `refresh` rebuilds the cached deltas of one point for a set of calculation
//! intervals. A [`Sweep`] walks every metering point and then every virtual
//! metering point, one entity per step, so a caller can stop between two
//! entities without leaving a half-written (point, interval) pair behind.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use tracing::{debug, error, info, warn};

use super::energy::EnergyService;
use crate::calc;
use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::models::{CalculationInterval, PointRef};

/// Which entities a recompute covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecomputeScope {
    #[value(name = "mp", alias = "point")]
    Points,
    #[value(name = "vmp", alias = "virtual_point")]
    VirtualPoints,
    All,
}

/// Outcome of one sweep step.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepProgress {
    pub target: PointRef,
    pub name: String,
    /// Position of `target` within its kind, starting at 1.
    pub done: usize,
    /// Entities of the same kind in this sweep.
    pub total: usize,
    pub rows: usize,
    pub error: Option<String>,
}

struct SweepItem {
    target: PointRef,
    name: String,
    done: usize,
    total: usize,
}

/// A pending pass over the points of one [`RecomputeScope`].
pub struct Sweep {
    queue: VecDeque<SweepItem>,
    intervals: Vec<CalculationInterval>,
}

impl Sweep {
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn is_finished(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Summary of a completed recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub rows: usize,
}

#[derive(Clone)]
pub struct PrecalculationCache {
    service: EnergyService,
}

impl PrecalculationCache {
    pub fn new(service: EnergyService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &EnergyService {
        &self.service
    }

    /// Recompute and atomically replace the cached deltas of `target`.
    ///
    /// `intervals` defaults to every registered calculation interval. Without
    /// an explicit range the refresh covers the data horizon of `target`,
    /// starting at the beginning of the calendar period that contains the
    /// earliest data. A point without data ends up with no cached rows.
    /// Returns the number of rows written.
    pub async fn refresh(
        &self,
        target: PointRef,
        intervals: Option<&[CalculationInterval]>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let registered;
        let intervals = match intervals {
            Some(intervals) => intervals,
            None => {
                registered = self.service.store().calculation_intervals().await?;
                &registered[..]
            }
        };
        if intervals.is_empty() {
            debug!(point = %target, "No calculation intervals registered");
            return Ok(0);
        }

        let horizon = match (start, end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => self.service.data_horizon(target).await?,
        };

        let mut written = 0;
        for interval in intervals {
            let spec = interval.spec(self.service.timezone());
            let rows = match horizon {
                Some((earliest, latest)) => {
                    let from = start.unwrap_or_else(|| calc::period_start(earliest, &spec));
                    let to = end.unwrap_or(latest);
                    self.service
                        .energy_data(target, from, to, &spec, false)
                        .await?
                        .cached_rows()
                }
                None => Vec::new(),
            };
            self.service
                .store()
                .replace_cached_deltas(target, interval.id, &rows)
                .await?;
            debug!(point = %target, interval = %spec, rows = rows.len(), "Refreshed cache");
            written += rows.len();
        }
        Ok(written)
    }

    /// Queue every entity of `scope`: metering points first, then virtual
    /// metering points, each in id order.
    pub async fn sweep(&self, scope: RecomputeScope) -> Result<Sweep> {
        let store = self.service.store();
        let mut queue = VecDeque::new();

        if matches!(scope, RecomputeScope::Points | RecomputeScope::All) {
            let points = store.metering_points().await?;
            let total = points.len();
            queue.extend(points.into_iter().enumerate().map(|(i, mp)| SweepItem {
                target: PointRef::Metering(mp.id),
                name: mp.name,
                done: i + 1,
                total,
            }));
        }
        if matches!(scope, RecomputeScope::VirtualPoints | RecomputeScope::All) {
            let points = store.virtual_metering_points().await?;
            let total = points.len();
            queue.extend(points.into_iter().enumerate().map(|(i, vmp)| SweepItem {
                target: PointRef::Virtual(vmp.id),
                name: vmp.name,
                done: i + 1,
                total,
            }));
        }

        let intervals = store.calculation_intervals().await?;
        Ok(Sweep { queue, intervals })
    }

    /// Refresh the next entity of `sweep`; `None` once the sweep is done.
    ///
    /// A failing entity is reported in the progress and does not stop the sweep.
    pub async fn step(&self, sweep: &mut Sweep) -> Option<SweepProgress> {
        let item = sweep.queue.pop_front()?;
        let kind = match item.target {
            PointRef::Metering(_) => "mp",
            PointRef::Virtual(_) => "vmp",
        };

        let (rows, error) = match self
            .refresh(item.target, Some(&sweep.intervals), None, None)
            .await
        {
            Ok(rows) => {
                info!("{kind} {}/{}: {} done", item.done, item.total, item.name);
                (rows, None)
            }
            Err(e) => {
                error!(point = %item.target, error = %e, "{kind} {}/{}: {} failed", item.done, item.total, item.name);
                (0, Some(e.to_string()))
            }
        };

        Some(SweepProgress {
            target: item.target,
            name: item.name,
            done: item.done,
            total: item.total,
            rows,
            error,
        })
    }

    /// Run a whole sweep over `scope` to completion.
    pub async fn recompute(&self, scope: RecomputeScope) -> Result<RecomputeSummary> {
        let mut sweep = self.sweep(scope).await?;
        let mut summary = RecomputeSummary::default();
        while let Some(progress) = self.step(&mut sweep).await {
            if progress.error.is_some() {
                summary.failed += 1;
            } else {
                summary.refreshed += 1;
                summary.rows += progress.rows;
            }
        }
        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            rows = summary.rows,
            "Recompute finished"
        );
        Ok(summary)
    }

    /// Sweep everything every `sweep_interval_secs` until `shutdown` resolves.
    ///
    /// Shutdown is honoured between two entities and while waiting.
    pub async fn run<F>(&self, config: &MaintenanceConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Maintenance sweep started (interval: {}s, step delay: {}ms)",
            config.sweep_interval_secs, config.step_delay_ms
        );
        tokio::pin!(shutdown);
        let step_delay = Duration::from_millis(config.step_delay_ms);
        let sweep_interval = Duration::from_secs(config.sweep_interval_secs);

        loop {
            match self.sweep(RecomputeScope::All).await {
                Ok(mut sweep) => {
                    info!(entities = sweep.remaining(), "Sweep started");
                    while self.step(&mut sweep).await.is_some() {
                        if sweep.is_finished() {
                            break;
                        }
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => {
                                info!(remaining = sweep.remaining(), "Shutdown requested, stopping sweep");
                                return Ok(());
                            }
                            _ = tokio::time::sleep(step_delay) => {}
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Could not start sweep"),
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(sweep_interval) => {}
            }
        }
    }
}
