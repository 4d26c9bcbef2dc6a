use anyhow::Context;
use clap::Parser;
use dfm::config::{EnvConfig, SiteConfig};
use dfm::registry::ApiRegistry;
use dfm::telemetry::{init_telemetry, TelemetryConfig};
use dfm_broker::{RedisBroker, RequestStore};
use dfm_cache::CacheConfig;
use dfm_executor::{builtin_site, AdapterRegistry, Executor, ExecutorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// DFM execution service.
///
/// Pulls ready nodes off the execution queue and runs them through the
/// adapters bound by the site configuration.
#[derive(Parser)]
#[command(name = "dfm-executor")]
#[command(version = dfm::VERSION)]
#[command(about = "DFM execution service", long_about = None)]
struct Args {
    /// Site configuration YAML. Without it, the built-in dfm provider is
    /// served.
    #[arg(long)]
    site_config: Option<PathBuf>,

    /// Worker-pool size override (default: DFM_WORKERS or CPU count).
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env = EnvConfig::from_env().context("invalid environment configuration")?;
    init_telemetry(&TelemetryConfig::from_env("dfm-executor", &env))
        .context("cannot initialize telemetry")?;

    let site = match &args.site_config {
        Some(path) => SiteConfig::from_path(path).context("invalid site configuration")?,
        None => builtin_site("dfm-dev"),
    };
    info!("serving site '{}'", site.site);

    let registry = Arc::new(ApiRegistry::builtin());
    let dispatch =
        AdapterRegistry::from_site(&site, &registry).context("invalid adapter bindings")?;

    let broker = RedisBroker::connect(&env.broker_url, env.broker_db)
        .await
        .context("cannot connect to the broker")?;
    let store = RequestStore::new(Arc::new(broker), env.request_ttl);

    let cache_config = CacheConfig {
        budget_bytes: env.cache_budget_bytes,
        ..CacheConfig::default()
    };
    let executor_config = ExecutorConfig {
        workers: args.workers.unwrap_or(env.workers),
        ..ExecutorConfig::default()
    };

    let handle = Executor::new(store, registry, dispatch, cache_config, executor_config).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
