use anyhow::Context;
use sqlx::PgPool;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::{build_router, AppState, GatewayConfig, GatewayMetrics, RedisHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(GatewayConfig::from_env()?);

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let db = PgPool::connect(&config.postgres_dsn())
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("Failed to run migrations")?;

    let redis = RedisHandle::new(&config.redis_url())?;
    let metrics = Arc::new(GatewayMetrics::new()?);
    let state = AppState::new(db, redis, config.clone(), metrics);
    let app = build_router(state);

    let ip: IpAddr = config
        .app_host
        .parse()
        .context("APP_HOST must be an IP address")?;
    let addr = SocketAddr::from((ip, config.app_port));
    info!(%addr, "starting gatekeeper");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
