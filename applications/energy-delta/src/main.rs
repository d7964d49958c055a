use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use energy_delta::config::Config;
use energy_delta::models::{IntervalSpec, PointRef};
use energy_delta::repositories::PgEnergyStore;
use energy_delta::services::{EnergyService, PrecalculationCache, RecomputeScope};
use energy_delta::db;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "energy-delta")]
#[command(author, version, about = "Energy delta calculation and precalculation maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute the precalculated deltas once
    Recompute {
        /// mp (point), vmp (virtual_point) or all
        #[arg(value_enum, default_value = "all")]
        scope: RecomputeScope,
    },

    /// Sweep all points periodically until interrupted
    Daemon,

    /// Validate a calculation and list the variables it uses
    Check {
        calculation: String,
        /// Validate as the calculation of this virtual metering point
        #[arg(long)]
        virtual_point: Option<i64>,
    },

    /// Print the energy series of a point as JSON
    #[command(group(ArgGroup::new("target").required(true).args(["point", "virtual_point"])))]
    Energy {
        #[arg(long)]
        point: Option<i64>,
        #[arg(long)]
        virtual_point: Option<i64>,
        /// RFC 3339 instant
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 instant
        #[arg(long)]
        end: DateTime<Utc>,
        /// Seconds, or hour|day|week|month|quarter|year
        #[arg(long, default_value = "day")]
        interval: String,
        /// Defaults to the configured calculation timezone
        #[arg(long)]
        timezone: Option<String>,
        /// Read from the precalculated cache instead of computing
        #[arg(long)]
        precalculated: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    let timezone = cfg.timezone()?;
    info!(timezone = %timezone, "Configuration loaded");

    let pool = db::connect(&cfg.database.url, cfg.database.max_connections).await?;
    db::ensure_cache_schema(&pool).await?;
    info!("Connected to database");

    let store = Arc::new(PgEnergyStore::new(pool));
    let service = EnergyService::new(store, timezone);

    match cli.command {
        Commands::Recompute { scope } => {
            let summary = PrecalculationCache::new(service).recompute(scope).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} of {} points failed", summary.failed, summary.failed + summary.refreshed);
            }
        }
        Commands::Daemon => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for CTRL+C");
                    std::future::pending::<()>().await;
                }
                info!("Shutdown signal received");
            };
            PrecalculationCache::new(service)
                .run(&cfg.maintenance, shutdown)
                .await?;
        }
        Commands::Check {
            calculation,
            virtual_point,
        } => {
            service.check_calculation(&calculation, virtual_point).await?;
            let used = service.used_variables(&calculation).await?;
            println!("Calculation is valid.\nUsed Variables:\n{used}");
        }
        Commands::Energy {
            point,
            virtual_point,
            start,
            end,
            interval,
            timezone: tz_name,
            precalculated,
        } => {
            let target = match (point, virtual_point) {
                (Some(id), _) => PointRef::Metering(id),
                (None, Some(id)) => PointRef::Virtual(id),
                (None, None) => anyhow::bail!("either --point or --virtual-point is required"),
            };
            let tz_name = tz_name.unwrap_or_else(|| cfg.calculation.timezone.clone());
            let spec = IntervalSpec::parse(&interval, &tz_name)?;
            let series = service
                .energy_data(target, start, end, &spec, precalculated)
                .await?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
    }

    info!("Done");
    Ok(())
}
