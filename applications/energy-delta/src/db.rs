use crate::error::AppError;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::info;

pub type DbPool = Pool<Postgres>;

pub async fn connect(url: &str, max_connections: u32) -> Result<DbPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

/// Create the tables this service owns: registered calculation intervals
/// and the two precalculated delta tables. Points, meters and readings
/// belong to the ingestion side and are expected to exist.
pub async fn ensure_cache_schema(pool: &DbPool) -> Result<(), AppError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS calculation_interval
        (
            id              SERIAL PRIMARY KEY,
            interval_length TEXT NOT NULL,
            timezone        TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS calculated_mp_energy_delta
        (
            metering_point_id BIGINT           NOT NULL,
            interval_id       INTEGER          NOT NULL REFERENCES calculation_interval (id) ON DELETE CASCADE,
            reading_date      TIMESTAMPTZ      NOT NULL,
            energy_delta      DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (metering_point_id, interval_id, reading_date)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS calculated_vmp_energy_delta
        (
            virtual_metering_point_id BIGINT           NOT NULL,
            interval_id               INTEGER          NOT NULL REFERENCES calculation_interval (id) ON DELETE CASCADE,
            reading_date              TIMESTAMPTZ      NOT NULL,
            energy_delta              DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (virtual_metering_point_id, interval_id, reading_date)
        )
        "#,
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    info!("Cache schema ready");
    Ok(())
}
