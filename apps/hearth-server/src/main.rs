#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use hearth_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let heartbeat_interval_secs = std::env::var("HEARTH_HEARTBEAT_INTERVAL_SECS").map_or_else(
        |_| Ok(AppConfig::default().heartbeat_interval.as_secs()),
        |value| {
            value.parse::<u64>().map_err(|e| {
                anyhow::anyhow!("invalid HEARTH_HEARTBEAT_INTERVAL_SECS value {value:?}: {e}")
            })
        },
    )?;
    let gateway_outbound_queue = std::env::var("HEARTH_GATEWAY_OUTBOUND_QUEUE").map_or_else(
        |_| Ok(AppConfig::default().gateway_outbound_queue),
        |value| {
            value.parse::<usize>().map_err(|e| {
                anyhow::anyhow!("invalid HEARTH_GATEWAY_OUTBOUND_QUEUE value {value:?}: {e}")
            })
        },
    )?;
    let app_config = AppConfig {
        heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
        gateway_outbound_queue,
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("HEARTH_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid HEARTH_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "hearth-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
