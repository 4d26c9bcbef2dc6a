use anyhow::Context;
use clap::Parser;
use dfm::config::EnvConfig;
use dfm::telemetry::{init_telemetry, TelemetryConfig};
use dfm_broker::{RedisBroker, RequestStore};
use dfm_scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use tracing::info;

/// DFM delayed-scheduling service.
#[derive(Parser)]
#[command(name = "dfm-scheduler")]
#[command(version = dfm::VERSION)]
#[command(about = "DFM delayed-scheduling service", long_about = None)]
struct Args {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _args = Args::parse();

    let env = EnvConfig::from_env().context("invalid environment configuration")?;
    init_telemetry(&TelemetryConfig::from_env("dfm-scheduler", &env))
        .context("cannot initialize telemetry")?;

    let broker = RedisBroker::connect(&env.broker_url, env.broker_db)
        .await
        .context("cannot connect to the broker")?;
    let store = RequestStore::new(Arc::new(broker), env.request_ttl);

    let handle = Scheduler::new(store, SchedulerConfig::default()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
