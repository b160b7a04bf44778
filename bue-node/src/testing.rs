//! Shared fixtures for the node's unit tests.

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::gps::NoFix;
use crate::state::{new_state, Lifecycle, NodeConnectionState};
use crate::worker::{Task, TASK_QUEUE_CAPACITY};
use bue_devkit::TestHarness;
use bue_ota::Shutdown;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn config(id: u16) -> NodeConfig {
    NodeConfig::from_yaml(&format!(
        "OTA_PORT: mock\nOTA_BAUDRATE: 9600\nOTA_ID: {id}\nHOSTNAME: bue-{id}\nUPDATE_PACING_MS: 0\n"
    ))
    .unwrap()
}

pub fn node_with(config: NodeConfig) -> (TestHarness, NodeContext, mpsc::Receiver<Task>) {
    let harness = TestHarness::new(config.ota_id);
    let (tasks, rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
    let state = NodeConnectionState::new(config.ota_id, config.hostname());
    let ctx = NodeContext {
        ota: harness.ota.clone(),
        state: new_state(state),
        config: Arc::new(config),
        gps: Arc::new(NoFix),
        tasks,
        shutdown: Shutdown::new(),
    };
    (harness, ctx, rx)
}

pub fn node(id: u16) -> (TestHarness, NodeContext, mpsc::Receiver<Task>) {
    node_with(config(id))
}

/// Node already in `Idle` with `base_id` as its peer.
pub fn connected_node(id: u16, base_id: u16) -> (TestHarness, NodeContext, mpsc::Receiver<Task>) {
    let fixture = node(id);
    {
        let mut state = fixture.1.state.lock();
        state.enter(Lifecycle::Connecting);
        state.accept_connection(base_id);
        state.enter(Lifecycle::Idle);
    }
    fixture
}
