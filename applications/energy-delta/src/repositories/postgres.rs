use super::EnergyStore;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{
    CachedDelta, CalculationInterval, EnergyMeter, MeteringPoint, PointRef, Reading,
    VirtualMeteringPoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Row};
use tracing::debug;

#[derive(Clone)]
pub struct PgEnergyStore {
    pool: DbPool,
}

impl PgEnergyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Cache table and point column for each kind of point.
fn cache_table(target: PointRef) -> (&'static str, &'static str) {
    match target {
        PointRef::Metering(_) => ("calculated_mp_energy_delta", "metering_point_id"),
        PointRef::Virtual(_) => ("calculated_vmp_energy_delta", "virtual_metering_point_id"),
    }
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("42P01") || db_err.message().contains("does not exist")
        }
        _ => false,
    }
}

impl<'r> FromRow<'r, PgRow> for CachedDelta {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            reading_date: row.try_get("reading_date")?,
            energy_delta: row.try_get("energy_delta")?,
        })
    }
}

#[async_trait]
impl EnergyStore for PgEnergyStore {
    async fn metering_point(&self, id: i64) -> Result<Option<MeteringPoint>, AppError> {
        sqlx::query_as::<_, MeteringPoint>(
            r#"
            SELECT id, name, higher_level_metering_points
            FROM metering_point
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn metering_points(&self) -> Result<Vec<MeteringPoint>, AppError> {
        sqlx::query_as::<_, MeteringPoint>(
            r#"
            SELECT id, name, higher_level_metering_points
            FROM metering_point
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn virtual_metering_point(&self, id: i64) -> Result<Option<VirtualMeteringPoint>, AppError> {
        sqlx::query_as::<_, VirtualMeteringPoint>(
            r#"
            SELECT id, name, calculation, weather_adjustment_id
            FROM virtual_metering_point
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn virtual_metering_points(&self) -> Result<Vec<VirtualMeteringPoint>, AppError> {
        sqlx::query_as::<_, VirtualMeteringPoint>(
            r#"
            SELECT id, name, calculation, weather_adjustment_id
            FROM virtual_metering_point
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn meters_of_point(&self, point_id: i64) -> Result<Vec<EnergyMeter>, AppError> {
        sqlx::query_as::<_, EnergyMeter>(
            r#"
            SELECT
                id,
                metering_point_id,
                counting_mode,
                factor,
                initial_value,
                in_operation_from,
                in_operation_to
            FROM energy_meter
            WHERE metering_point_id = $1
            ORDER BY id
            "#,
        )
        .bind(point_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn readings(
        &self,
        meter_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, AppError> {
        // window plus one bracketing reading on each side
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            (SELECT id, reading_date, reading FROM energy_reading
             WHERE meter_id = $1 AND reading_date < $2
             ORDER BY reading_date DESC, id DESC
             LIMIT 1)
            UNION ALL
            (SELECT id, reading_date, reading FROM energy_reading
             WHERE meter_id = $1 AND reading_date >= $2 AND reading_date <= $3)
            UNION ALL
            (SELECT id, reading_date, reading FROM energy_reading
             WHERE meter_id = $1 AND reading_date > $3
             ORDER BY reading_date ASC, id ASC
             LIMIT 1)
            ORDER BY reading_date, id
            "#,
        )
        .bind(meter_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)?;

        debug!(meter = meter_id, count = readings.len(), "Loaded readings");
        Ok(readings)
    }

    async fn reading_bounds(
        &self,
        meter_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, AppError> {
        let row: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT MIN(reading_date), MAX(reading_date)
            FROM energy_reading
            WHERE meter_id = $1
            "#,
        )
        .bind(meter_id)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Db)?;

        Ok(match row {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        })
    }

    async fn calculation_intervals(&self) -> Result<Vec<CalculationInterval>, AppError> {
        sqlx::query_as::<_, CalculationInterval>(
            r#"
            SELECT id, interval_length, timezone
            FROM calculation_interval
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)
    }

    async fn cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CachedDelta>, AppError> {
        let (table, column) = cache_table(target);
        let sql = format!(
            r#"
            SELECT reading_date, energy_delta
            FROM {table}
            WHERE {column} = $1 AND interval_id = $2
              AND reading_date >= $3 AND reading_date <= $4
            ORDER BY reading_date
            "#
        );
        match sqlx::query_as::<_, CachedDelta>(&sql)
            .bind(target.id())
            .bind(interval_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(e) if is_missing_relation(&e) => {
                // cache schema not created yet, nothing precalculated
                tracing::warn!(table, "Cache table missing, returning no rows");
                Ok(Vec::new())
            }
            Err(e) => Err(AppError::Db(e)),
        }
    }

    async fn replace_cached_deltas(
        &self,
        target: PointRef,
        interval_id: i32,
        rows: &[CachedDelta],
    ) -> Result<(), AppError> {
        let (table, column) = cache_table(target);
        let mut tx = self.pool.begin().await?;

        // serializes refreshes of the same (point, interval); released on commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{table}:{}:{interval_id}", target.id()))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "DELETE FROM {table} WHERE {column} = $1 AND interval_id = $2"
        ))
        .bind(target.id())
        .bind(interval_id)
        .execute(&mut *tx)
        .await?;

        if !rows.is_empty() {
            let dates: Vec<DateTime<Utc>> = rows.iter().map(|r| r.reading_date).collect();
            let deltas: Vec<f64> = rows.iter().map(|r| r.energy_delta).collect();
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} ({column}, interval_id, reading_date, energy_delta)
                SELECT $1, $2, d.reading_date, d.energy_delta
                FROM UNNEST($3::timestamptz[], $4::float8[]) AS d(reading_date, energy_delta)
                "#
            ))
            .bind(target.id())
            .bind(interval_id)
            .bind(dates)
            .bind(deltas)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(point = %target, interval = interval_id, rows = rows.len(), "Replaced cached deltas");
        Ok(())
    }
}
