//! bUE node - field unit reachable over the LoRa link
//!
//! Runs on each buoy and keeps a single connection to a base station:
//! - Broadcast discovery (REQ/CON/ACK) and periodic PING liveness
//! - Scheduled test scripts with live output relayed as UPD frames
//! - Remote cancel, service reload and reboot

mod config;
mod context;
mod dispatch;
mod execution;
mod gps;
mod machine;
mod state;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::{anyhow, Context, Result};
use bue_ota::{Ota, SerialChannel, Shutdown};
use config::NodeConfig;
use context::NodeContext;
use dispatch::Dispatcher;
use gps::{GpsdSource, PositionSource};
use state::{new_state, NodeConnectionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(
        NodeConfig::load()
            .await
            .context("Failed to load node configuration")?,
    );
    let hostname = config.hostname();
    info!(bue_id = config.ota_id, %hostname, "bUE node starting");

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

    let gps: Arc<dyn PositionSource> = Arc::new(GpsdSource::new(
        &config.gpsd_addr,
        Duration::from_secs(config.gps_timeout_secs),
        config.gps_min_fixes,
    ));
    let (tasks, tasks_rx) = mpsc::channel(worker::TASK_QUEUE_CAPACITY);
    let ctx = NodeContext {
        ota,
        state: new_state(NodeConnectionState::new(config.ota_id, hostname)),
        config,
        gps,
        tasks,
        shutdown,
    };

    let worker = tokio::spawn(worker::run_worker(ctx.clone(), tasks_rx));
    let ticker = tokio::spawn(machine::run_tick_loop(ctx.clone(), Dispatcher::new(ctx.clone())));

    let (worker, ticker) = tokio::join!(worker, ticker);
    if let Err(e) = worker {
        error!("task worker failed: {}", e);
    }
    if let Err(e) = ticker {
        error!("tick loop failed: {}", e);
    }
    transport
        .join()
        .map_err(|_| anyhow!("transport thread panicked"))?;

    info!("bUE node stopped");
    Ok(())
}
