//! Task-queue worker: executes the protocol actions the tick loop enqueues,
//! one at a time and in order.

use crate::context::NodeContext;
use crate::gps::Position;
use crate::state::Liveness;
use bue_ota::{MessageType, BROADCAST_ID};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const TASK_QUEUE_CAPACITY: usize = 64;
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    ConnectRequest,
    SendPing,
    SendUpdate,
    Interrupt,
    Reload,
    Restart,
}

pub async fn run_worker(ctx: NodeContext, mut tasks: mpsc::Receiver<Task>) {
    debug!("task worker started");
    while !ctx.shutdown.is_triggered() {
        match timeout(RECV_TIMEOUT, tasks.recv()).await {
            Ok(Some(task)) => execute(&ctx, task).await,
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    debug!("task worker stopped");
}

pub async fn execute(ctx: &NodeContext, task: Task) {
    match task {
        Task::ConnectRequest => connect_request(ctx),
        Task::SendPing => send_ping(ctx).await,
        Task::SendUpdate => send_update(ctx).await,
        Task::Interrupt => interrupt(ctx),
        Task::Reload => run_command(&ctx.config.reload_command, "reload").await,
        Task::Restart => run_command(&ctx.config.restart_command, "restart").await,
    }
}

fn connect_request(ctx: &NodeContext) {
    let body = {
        let state = ctx.state.lock();
        if state.peer_base_id.is_some() {
            return;
        }
        format!("{},{}", state.hostname, state.own_id)
    };
    ctx.ota.send(BROADCAST_ID, MessageType::Req, Some(&body));
    debug!(%body, "sent connection request");
}

async fn send_ping(ctx: &NodeContext) {
    let max_missed = ctx.config.max_missed_pings;
    let (peer, liveness, lifecycle, missed) = {
        let mut state = ctx.state.lock();
        let Some(peer) = state.peer_base_id else {
            warn!("ping requested while not connected to a base station");
            return;
        };
        let liveness = state.register_ping(max_missed);
        (peer, liveness, state.lifecycle, state.missed_liveness)
    };

    match liveness {
        Liveness::Healthy => {}
        Liveness::Warning => warn!(base_id = peer, missed, "haven't heard from base station in a while"),
        Liveness::Lost => {
            warn!(base_id = peer, missed, "base station silent for too long, disconnecting");
            return;
        }
    }

    let position = ctx.position().await;
    let body = format!("{},{},{}", lifecycle.as_str(), position.lat, position.lon);
    ctx.ota.send(peer, MessageType::Ping, Some(&body));
    debug!(base_id = peer, %body, "sent ping");
}

async fn send_update(ctx: &NodeContext) {
    let (peer, job) = {
        let state = ctx.state.lock();
        (state.peer_base_id, state.active_job.clone())
    };
    let (Some(peer), Some(job)) = (peer, job) else {
        debug!("no connected job to report on");
        return;
    };

    let position = ctx.position().await;
    flush_output(ctx, peer, &position, job.drain_output()).await;
}

/// Sends one `UPD` per captured line, or a single empty one when nothing was
/// captured. Consecutive frames are spaced by the configured pacing.
pub async fn flush_output(ctx: &NodeContext, peer: u16, position: &Position, lines: Vec<String>) {
    if lines.is_empty() {
        let body = format!("{},{},", position.lat, position.lon);
        ctx.ota.send(peer, MessageType::Upd, Some(&body));
        debug!(base_id = peer, "sent UPD with no console output");
        return;
    }

    let pacing = ctx.config.update_pacing();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        let body = format!("{},{},{}", position.lat, position.lon, line);
        ctx.ota.send(peer, MessageType::Upd, Some(&body));
        debug!(base_id = peer, %line, "sent UPD with console output");
    }
}

fn interrupt(ctx: &NodeContext) {
    match ctx.state.lock().active_job.as_ref() {
        Some(job) => {
            info!(job_id = %job.id, script = %job.script, "cancelling test job");
            job.cancel();
        }
        None => debug!("interrupt requested with no active job"),
    }
}

async fn run_command(command: &[String], what: &str) {
    let Some((program, args)) = command.split_first() else {
        warn!("no {} command configured", what);
        return;
    };
    info!(?command, "running {} command", what);
    match Command::new(program).args(args).status().await {
        Ok(status) if status.success() => info!("{} command finished", what),
        Ok(status) => warn!(code = ?status.code(), "{} command failed", what),
        Err(e) => error!("failed to run {} command: {}", what, e),
    }
}
