use anyhow::Context;
use clap::Parser;
use dfm::config::{EnvConfig, SiteConfig};
use dfm::registry::ApiRegistry;
use dfm::telemetry::{init_telemetry, TelemetryConfig};
use dfm_broker::{RedisBroker, RequestStore};
use dfm_process::{build_router, serve, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// DFM ingress service.
#[derive(Parser)]
#[command(name = "dfm-process")]
#[command(version = dfm::VERSION)]
#[command(about = "DFM ingress service", long_about = None)]
struct Args {
    /// Site configuration YAML.
    #[arg(long)]
    site_config: PathBuf,

    /// Bind address override (default: DFM_BIND_ADDR).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env = EnvConfig::from_env().context("invalid environment configuration")?;
    init_telemetry(&TelemetryConfig::from_env("dfm-process", &env))
        .context("cannot initialize telemetry")?;

    let site =
        SiteConfig::from_path(&args.site_config).context("invalid site configuration")?;
    info!("serving site '{}'", site.site);

    let broker = RedisBroker::connect(&env.broker_url, env.broker_db)
        .await
        .context("cannot connect to the broker")?;
    let store = RequestStore::new(Arc::new(broker), env.request_ttl);

    let mut state = AppState::new(store, Arc::new(ApiRegistry::builtin()), Arc::new(site));
    if let Some(token) = &env.auth_token {
        state = state.with_auth_token(token.clone());
    }
    let router = build_router(state);

    let bind_addr = args.bind.unwrap_or_else(|| env.bind_addr.clone());
    serve(router, &bind_addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await
    .context("server error")?;

    Ok(())
}
