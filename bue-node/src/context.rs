use crate::config::NodeConfig;
use crate::gps::{Position, PositionSource};
use crate::state::{NodeConnectionState, Shared};
use crate::worker::Task;
use bue_ota::{Ota, Shutdown};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Everything a node task needs, cheap to clone into each of them.
#[derive(Clone)]
pub struct NodeContext {
    pub ota: Ota,
    pub state: Shared<NodeConnectionState>,
    pub config: Arc<NodeConfig>,
    pub gps: Arc<dyn PositionSource>,
    pub tasks: mpsc::Sender<Task>,
    pub shutdown: Shutdown,
}

impl NodeContext {
    /// Hands `task` to the worker without blocking the caller.
    pub fn enqueue(&self, task: Task) {
        match self.tasks.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => warn!(?task, "task queue full, dropping task"),
            Err(TrySendError::Closed(task)) => warn!(?task, "worker stopped, dropping task"),
        }
    }

    pub fn peer(&self) -> Option<u16> {
        self.state.lock().peer_base_id
    }

    /// Best-effort GPS fix; the lookup blocks so it runs off the runtime.
    pub async fn position(&self) -> Position {
        let gps = Arc::clone(&self.gps);
        tokio::task::spawn_blocking(move || gps.fix())
            .await
            .unwrap_or_default()
    }
}
