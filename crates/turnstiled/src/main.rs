use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{BusKind, Config};
use dbus_interface::{AccessService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "turnstiled starting");

    let config = Config::load()?;
    let engine = engine::spawn_engine(&config)?;

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AccessService::new(engine.clone()))?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "turnstiled ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("turnstiled shutting down");
    engine.shutdown().await;

    Ok(())
}
