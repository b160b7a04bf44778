/*!
 * bUE BASE STATION - Coordinates the fleet of bUEs over the LoRa link
 *
 * Answers connection requests, tracks liveness of every connected bUE,
 * dispatches test jobs and collects their outcomes. Operators drive it from
 * the stdin console.
 */

mod config;
mod console;
mod geo;
mod roster;
mod state;
mod station;

use crate::config::BaseConfig;
use crate::roster::{spawn_liveness_sweep, Roster};
use crate::state::new_state;
use crate::station::{spawn_message_listener, BaseStation};
use anyhow::{anyhow, Context, Result};
use bue_ota::{Ota, SerialChannel, Shutdown};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BaseConfig::load()
        .await
        .context("Failed to load base station configuration")?;
    info!(base_id = config.ota_id, port = %config.ota_port, "base station starting");

    let shutdown = Shutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        }
    });

    let channel = {
        let (port, baud, shutdown) = (config.ota_port.clone(), config.ota_baudrate, shutdown.clone());
        tokio::task::spawn_blocking(move || SerialChannel::open_with_retry(&port, baud, &shutdown))
            .await
            .context("Serial open task failed")?
    };
    let Some(channel) = channel else {
        info!("shutdown requested before the radio came up");
        return Ok(());
    };

    let (ota, pump) = Ota::new(config.ota_id, Box::new(channel));
    let transport = pump
        .spawn(shutdown.clone())
        .context("Failed to start transport thread")?;

    let roster = new_state(Roster::new());
    let station = BaseStation::new(ota, roster.clone());

    let listener = spawn_message_listener(station.clone(), config.poll_interval(), shutdown.clone());
    let sweep = spawn_liveness_sweep(
        roster,
        config.liveness_timeout(),
        config.max_missed_pings,
        shutdown.clone(),
    );

    console::run(station, shutdown.clone()).await;
    shutdown.trigger();

    for (name, task) in [("message listener", listener), ("liveness sweep", sweep)] {
        if let Err(e) = task.await {
            error!("{} failed: {}", name, e);
        }
    }
    transport
        .join()
        .map_err(|_| anyhow!("transport thread panicked"))?;

    info!("base station stopped");
    Ok(())
}
