// End-to-end tests of the calculation engine against the in-memory store.
// No database required.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Europe::Berlin;
use energy_delta::calc::{self, CalculationError};
use energy_delta::error::AppError;
use energy_delta::models::{
    CalculationInterval, CountingMode, EnergyMeter, IntervalLength, IntervalSpec, MeteringPoint,
    PointRef, Reading, VirtualMeteringPoint,
};
use energy_delta::repositories::MemoryStore;
use energy_delta::services::{EnergyService, PrecalculationCache, RecomputeScope};
use pretty_assertions::assert_eq;

const HOUR_INTERVAL: i32 = 1;
const DAY_INTERVAL: i32 = 2;

fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
}

fn hourly() -> IntervalSpec {
    IntervalSpec::new(IntervalLength::Hour, Berlin)
}

fn berlin(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Berlin
        .with_ymd_and_hms(y, m, d, 0, 0, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

/// mp(7): +1 per hour, mp(8): +2 per hour, both over 48 hours.
async fn fixture() -> (EnergyService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());

    store.insert_metering_point(MeteringPoint::new(7, "Heat pump")).await;
    store.insert_metering_point(MeteringPoint::new(8, "Household")).await;
    store.insert_meter(EnergyMeter::new(70, 7)).await;
    store.insert_meter(EnergyMeter::new(80, 8)).await;
    store
        .insert_readings(70, (0..=48).map(|h| Reading::new(t(h), h as f64)))
        .await;
    store
        .insert_readings(80, (0..=48).map(|h| Reading::new(t(h), 100.0 + 2.0 * h as f64)))
        .await;

    for (id, name, calculation) in [
        (1, "Constant", "2"),
        (2, "Total", "mp(7) + mp(8)"),
        (3, "Broken", "mp(999999)"),
        (4, "Loop A", "vmp(5) + 1"),
        (5, "Loop B", "vmp(4) + 1"),
        (6, "Third of total", "vmp(2) / 3"),
    ] {
        store
            .insert_virtual_metering_point(VirtualMeteringPoint::new(id, name, calculation))
            .await;
    }

    store
        .insert_interval(CalculationInterval {
            id: HOUR_INTERVAL,
            length: IntervalLength::Hour,
            timezone: None,
        })
        .await;
    store
        .insert_interval(CalculationInterval {
            id: DAY_INTERVAL,
            length: IntervalLength::Day,
            timezone: None,
        })
        .await;

    let service = EnergyService::new(store.clone(), Berlin);
    (service, store)
}

#[tokio::test]
async fn test_numeric_interval_has_eleven_boundaries() {
    let (service, _) = fixture().await;
    let spec = IntervalSpec::new(IntervalLength::Seconds(900), Berlin);
    let start = t(1);
    let end = start + Duration::seconds(900 * 10);

    let boundaries = calc::buckets(start, end, &spec);
    assert_eq!(boundaries.len(), 11);
    assert_eq!(boundaries[0], start);
    assert!(boundaries.windows(2).all(|w| w[1] - w[0] == Duration::seconds(900)));

    let series = service
        .energy_data(PointRef::Metering(7), start, end, &spec, false)
        .await
        .unwrap();
    assert_eq!(series.timestamps, boundaries[1..].to_vec());
    for v in &series.values {
        assert!((v - 0.25).abs() < 1e-9, "{v}");
    }
}

#[tokio::test]
async fn test_empty_range_gives_empty_series_everywhere() {
    let (service, _) = fixture().await;
    for target in [PointRef::Metering(7), PointRef::Virtual(2), PointRef::Virtual(1)] {
        for (start, end) in [(t(5), t(5)), (t(5), t(1))] {
            for cached in [false, true] {
                let series = service
                    .energy_data(target, start, end, &hourly(), cached)
                    .await
                    .unwrap();
                assert!(series.timestamps.is_empty() && series.values.is_empty());
            }
        }
    }
}

#[tokio::test]
async fn test_linear_counter_resamples_to_slope_times_width() {
    let (service, store) = fixture().await;
    store.insert_metering_point(MeteringPoint::new(9, "Linear")).await;
    store.insert_meter(EnergyMeter::new(90, 9)).await;
    // 0.5 per minute, sampled every 7 minutes
    store
        .insert_readings(
            90,
            (0..=120).map(|i| Reading::new(t(0) + Duration::minutes(7 * i), 3.5 * i as f64)),
        )
        .await;

    let spec = IntervalSpec::new(IntervalLength::Seconds(1800), Berlin);
    let start = t(0) + Duration::minutes(13);
    let series = service
        .energy_data(PointRef::Metering(9), start, start + Duration::hours(5), &spec, false)
        .await
        .unwrap();

    assert_eq!(series.len(), 10);
    for v in &series.values {
        assert!((v - 15.0).abs() < 1e-9, "{v}");
    }
}

#[test]
fn test_delta_meter_reconstruction_prepends_origin() {
    let mut meter = EnergyMeter::new(1, 1);
    meter.counting_mode = CountingMode::Delta;
    meter.in_operation_from = Some(t(0));
    meter.initial_value = Some(0.0);
    let readings = [
        Reading::new(t(1), 1.5),
        Reading::new(t(2), 2.0),
        Reading::new(t(3), 4.0),
    ];

    let curve = calc::reconstruct(&meter, &readings);
    assert_eq!(curve.timestamps, vec![t(0), t(1), t(2), t(3)]);
    assert_eq!(curve.values, vec![0.0, 1.5, 3.5, 7.5]);
}

#[tokio::test]
async fn test_constant_calculation_is_broadcast() {
    let (service, _) = fixture().await;
    let series = service
        .energy_data(PointRef::Virtual(1), t(0), t(7), &hourly(), false)
        .await
        .unwrap();
    assert_eq!(series.values, vec![2.0; 7]);
}

#[tokio::test]
async fn test_sum_of_points_matches_point_series() {
    let (service, _) = fixture().await;
    let spec = IntervalSpec::new(IntervalLength::Seconds(5400), Berlin);
    let (start, end) = (t(2), t(20));

    let a = service.energy_data(PointRef::Metering(7), start, end, &spec, false).await.unwrap();
    let b = service.energy_data(PointRef::Metering(8), start, end, &spec, false).await.unwrap();
    let sum = service.energy_data(PointRef::Virtual(2), start, end, &spec, false).await.unwrap();

    assert_eq!(sum.timestamps, a.timestamps);
    let expected: Vec<f64> = a.values.iter().zip(&b.values).map(|(x, y)| x + y).collect();
    assert_eq!(sum.values, expected);
}

#[tokio::test]
async fn test_evaluation_is_deterministic() {
    let (service, _) = fixture().await;
    let first = service
        .energy_data(PointRef::Virtual(6), t(0), t(12), &hourly(), false)
        .await
        .unwrap();
    let second = service
        .energy_data(PointRef::Virtual(6), t(0), t(12), &hourly(), false)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.values, vec![1.0; 12]);
}

#[tokio::test]
async fn test_unknown_point_is_zero_on_data_path_and_error_on_check() {
    let (service, _) = fixture().await;
    let series = service
        .energy_data(PointRef::Virtual(3), t(0), t(4), &hourly(), false)
        .await
        .unwrap();
    assert_eq!(series.values, vec![0.0; 4]);

    match service.check_calculation("mp(999999)", None).await {
        Err(AppError::CalculationSyntax(e)) => {
            assert_eq!(e.reason, CalculationError::UnknownPoint(999999));
            assert_eq!(e.formula, "mp(999999)");
        }
        other => panic!("expected a calculation syntax error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_check_calculation() {
    let (service, _) = fixture().await;
    service.check_calculation("mp(7) * 0.5 + vmp(6)", None).await.unwrap();
    service.check_calculation("3.6", Some(1)).await.unwrap();

    for bad in ["mp(7) +", "vmp(42)", "vmp(3)", "open('x')"] {
        let err = service.check_calculation(bad, None).await.unwrap_err();
        assert!(matches!(err, AppError::CalculationSyntax(_)), "{bad}: {err}");
    }
}

#[tokio::test]
async fn test_cycles_zero_fill_on_data_path_and_fail_validation() {
    let (service, _) = fixture().await;
    // vmp(4) -> vmp(5) -> vmp(4): the closing reference reads as zero
    let series = service
        .energy_data(PointRef::Virtual(4), t(0), t(3), &hourly(), false)
        .await
        .unwrap();
    assert_eq!(series.values, vec![2.0; 3]);

    match service.check_calculation("vmp(5) + 1", Some(4)).await {
        Err(AppError::CalculationSyntax(e)) => {
            assert_eq!(e.reason, CalculationError::CircularReference(4));
            assert_eq!(e.virtual_point, Some(4));
        }
        other => panic!("expected a circular reference, got {other:?}"),
    }
}

#[tokio::test]
async fn test_month_buckets_start_on_local_first() {
    let (service, _) = fixture().await;
    let spec = IntervalSpec::new(IntervalLength::Month, Berlin);
    let series = service
        .energy_data(PointRef::Virtual(1), berlin(2022, 1, 1), berlin(2022, 4, 1), &spec, false)
        .await
        .unwrap();

    assert_eq!(
        series.timestamps,
        vec![berlin(2022, 2, 1), berlin(2022, 3, 1), berlin(2022, 4, 1)]
    );
    assert_eq!(series.values, vec![2.0; 3]);
}

#[tokio::test]
async fn test_refresh_fills_cache_for_every_registered_interval() {
    let (service, store) = fixture().await;
    let cache = PrecalculationCache::new(service.clone());

    let written = cache.refresh(PointRef::Metering(7), None, None, None).await.unwrap();

    let hourly_rows = store.all_cached_deltas(PointRef::Metering(7), HOUR_INTERVAL).await;
    assert_eq!(hourly_rows.len(), 48);
    assert!(hourly_rows.iter().all(|r| (r.energy_delta - 1.0).abs() < 1e-9));

    // day buckets start at local midnight before the first reading
    let daily_rows = store.all_cached_deltas(PointRef::Metering(7), DAY_INTERVAL).await;
    assert_eq!(daily_rows.len(), 3);
    assert_eq!(daily_rows[0].reading_date, berlin(2022, 1, 2));
    let total: f64 = daily_rows.iter().map(|r| r.energy_delta).sum();
    assert!((total - 48.0).abs() < 1e-9);

    assert_eq!(written, 51);
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let (service, store) = fixture().await;
    let cache = PrecalculationCache::new(service);

    cache.refresh(PointRef::Virtual(2), None, None, None).await.unwrap();
    let once = store.all_cached_deltas(PointRef::Virtual(2), HOUR_INTERVAL).await;
    cache.refresh(PointRef::Virtual(2), None, None, None).await.unwrap();
    let twice = store.all_cached_deltas(PointRef::Virtual(2), HOUR_INTERVAL).await;

    assert_eq!(once.len(), 48);
    assert_eq!(once, twice);
}

#[tokio::test]
async fn test_precalculated_read_does_not_backfill() {
    let (service, _) = fixture().await;
    let cache = PrecalculationCache::new(service.clone());
    cache.refresh(PointRef::Metering(7), None, None, None).await.unwrap();

    let cached = service
        .energy_data(PointRef::Metering(7), t(0), t(5), &hourly(), true)
        .await
        .unwrap();
    assert_eq!(cached.values, vec![1.0; 5]);

    // bucket ends off the cached grid have no rows
    let shifted = t(0) + Duration::minutes(30);
    let cached = service
        .energy_data(PointRef::Metering(7), shifted, shifted + Duration::hours(2), &hourly(), true)
        .await
        .unwrap();
    assert_eq!(cached.values, vec![0.0, 0.0]);

    // never refreshed
    let cached = service
        .energy_data(PointRef::Metering(8), t(0), t(2), &hourly(), true)
        .await
        .unwrap();
    assert_eq!(cached.values, vec![0.0, 0.0]);

    // no registered interval for quarter
    let quarter = IntervalSpec::parse("quater", "Europe/Berlin").unwrap();
    let cached = service
        .energy_data(PointRef::Metering(7), berlin(2022, 1, 1), berlin(2022, 7, 1), &quarter, true)
        .await
        .unwrap();
    assert_eq!(cached.values, vec![0.0, 0.0]);
}

#[tokio::test]
async fn test_precalculated_hourly_read_ignores_timezone() {
    let (service, _) = fixture().await;
    let cache = PrecalculationCache::new(service.clone());
    cache.refresh(PointRef::Metering(7), None, None, None).await.unwrap();

    let utc_hourly = IntervalSpec::new(IntervalLength::Hour, chrono_tz::UTC);
    let cached = service
        .energy_data(PointRef::Metering(7), t(0), t(5), &utc_hourly, true)
        .await
        .unwrap();
    let fresh = service
        .energy_data(PointRef::Metering(7), t(0), t(5), &utc_hourly, false)
        .await
        .unwrap();
    assert_eq!(cached.values, vec![1.0; 5]);
    assert_eq!(cached, fresh);
}

#[tokio::test]
async fn test_refresh_without_data_clears_rows() {
    let (service, store) = fixture().await;
    let cache = PrecalculationCache::new(service);
    store.insert_metering_point(MeteringPoint::new(11, "Spare")).await;

    cache.refresh(PointRef::Virtual(1), None, Some(t(0)), Some(t(3))).await.unwrap();
    assert_eq!(store.all_cached_deltas(PointRef::Virtual(1), HOUR_INTERVAL).await.len(), 3);

    // a constant formula has no data horizon of its own
    let written = cache.refresh(PointRef::Virtual(1), None, None, None).await.unwrap();
    assert_eq!(written, 0);
    assert!(store.all_cached_deltas(PointRef::Virtual(1), HOUR_INTERVAL).await.is_empty());

    assert_eq!(cache.refresh(PointRef::Metering(11), None, None, None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_steps_points_then_virtual_points() {
    let (service, _) = fixture().await;
    let cache = PrecalculationCache::new(service);

    let mut sweep = cache.sweep(RecomputeScope::All).await.unwrap();
    assert_eq!(sweep.remaining(), 8);

    let mut seen = Vec::new();
    while let Some(progress) = cache.step(&mut sweep).await {
        assert!(progress.error.is_none(), "{:?}", progress.error);
        seen.push((progress.target, progress.done, progress.total));
    }

    assert_eq!(seen[0], (PointRef::Metering(7), 1, 2));
    assert_eq!(seen[1], (PointRef::Metering(8), 2, 2));
    assert_eq!(seen[2], (PointRef::Virtual(1), 1, 6));
    assert_eq!(seen[7], (PointRef::Virtual(6), 6, 6));
    assert!(sweep.is_finished());
}

#[tokio::test]
async fn test_recompute_scopes() {
    let (service, store) = fixture().await;
    let cache = PrecalculationCache::new(service);

    let summary = cache.recompute(RecomputeScope::Points).await.unwrap();
    assert_eq!(summary.refreshed, 2);
    assert_eq!(summary.failed, 0);
    assert!(store.all_cached_deltas(PointRef::Virtual(2), HOUR_INTERVAL).await.is_empty());

    let summary = cache.recompute(RecomputeScope::VirtualPoints).await.unwrap();
    assert_eq!(summary.refreshed, 6);
    assert_eq!(store.all_cached_deltas(PointRef::Virtual(2), HOUR_INTERVAL).await.len(), 48);
}

#[tokio::test]
async fn test_daemon_stops_on_shutdown() {
    let (service, store) = fixture().await;
    let cache = PrecalculationCache::new(service);
    let config = energy_delta::config::MaintenanceConfig {
        sweep_interval_secs: 3600,
        step_delay_ms: 1,
    };

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        cache
            .run(&config, async {
                rx.await.ok();
            })
            .await
    });

    // let the first sweep finish, then stop while it waits for the next one
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    tx.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(store.all_cached_deltas(PointRef::Metering(8), HOUR_INTERVAL).await.len(), 48);
}
