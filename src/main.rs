use std::sync::Arc;

use anyhow::Context;
use cloudprobe::cold_start::WarmState;
use cloudprobe::config::FileConfigLoader;
use cloudprobe::config::app_config::{load_app_config, setup_resolver, setup_tls_connector};
use cloudprobe::handler::{AppState, router};
use cloudprobe::probe::{DnsProber, HttpProber, IcmpProber, ProberSet, TcpProber};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_config = load_app_config().map_err(anyhow::Error::msg)?;

    let tls_connector = setup_tls_connector().context("Failed to build TLS connector")?;
    let resolver = setup_resolver(&app_config.dns_hosts).context("Invalid DNS host")?;

    let probers = ProberSet::new(
        Arc::new(HttpProber::new(tls_connector, resolver.clone())),
        Arc::new(TcpProber::new(resolver.clone())),
        Arc::new(DnsProber::new(resolver)),
        Arc::new(IcmpProber::new()),
    );

    // The module file is read on every request; only the warm state is kept around.
    let loader = Arc::new(FileConfigLoader::new(&app_config.config_file));
    let state = AppState::new(
        loader,
        probers,
        Arc::new(WarmState::new()),
        app_config.probe_timeout,
    );

    let addr = format!("{}:{}", app_config.listen_addr, app_config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        address = %addr,
        config_file = %app_config.config_file,
        timeout_seconds = app_config.probe_timeout.as_secs_f64(),
        "Probe endpoint listening"
    );

    axum::serve(listener, router(state))
        .await
        .context("Server failed")?;
    Ok(())
}
