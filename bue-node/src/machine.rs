//! Tick-driven lifecycle: Init -> Connecting -> Idle <-> Testing.
//!
//! Every tick drains the inbound queue through the dispatcher, then evaluates
//! the transition table against a snapshot of the connection state. Protocol
//! actions are enqueued for the worker, never run inline, so a slow action
//! cannot stretch the tick.

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::dispatch::Dispatcher;
use crate::state::{Lifecycle, StateSnapshot};
use crate::worker::Task;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub struct TickMachine {
    current: Lifecycle,
    counter: u32,
    connect_every: u32,
    ping_every: u32,
    update_every: u32,
    max_missed: u32,
}

impl TickMachine {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            current: Lifecycle::Init,
            counter: 0,
            connect_every: config.ticks_per(config.connect_interval_secs),
            ping_every: config.ticks_per(config.ping_interval_secs),
            update_every: config.ticks_per(config.update_interval_secs),
            max_missed: config.max_missed_pings,
        }
    }

    pub fn current(&self) -> Lifecycle {
        self.current
    }

    fn transition(&self, snapshot: &StateSnapshot) -> Lifecycle {
        let lost = snapshot.missed_liveness >= self.max_missed;
        match self.current {
            Lifecycle::Init => Lifecycle::Connecting,
            Lifecycle::Connecting if snapshot.peer_base_id.is_some() => Lifecycle::Idle,
            Lifecycle::Connecting => Lifecycle::Connecting,
            Lifecycle::Idle | Lifecycle::Testing if lost || snapshot.peer_base_id.is_none() => {
                Lifecycle::Connecting
            }
            Lifecycle::Idle if snapshot.has_job => Lifecycle::Testing,
            Lifecycle::Idle => Lifecycle::Idle,
            Lifecycle::Testing if !snapshot.has_job => Lifecycle::Idle,
            Lifecycle::Testing => Lifecycle::Testing,
        }
    }

    fn action(&mut self) -> Option<Task> {
        let (every, task) = match self.current {
            Lifecycle::Init => return None,
            Lifecycle::Connecting => (self.connect_every, Task::ConnectRequest),
            Lifecycle::Idle => (self.ping_every, Task::SendPing),
            Lifecycle::Testing => (self.update_every, Task::SendUpdate),
        };
        self.counter += 1;
        if self.counter < every {
            return None;
        }
        self.counter = 0;
        Some(task)
    }

    /// One tick: picks the next state and the action due in the current one.
    pub fn step(&mut self, snapshot: &StateSnapshot) -> (Lifecycle, Option<Task>) {
        let next = self.transition(snapshot);
        let task = self.action();
        if next != self.current {
            info!("state changed from {} to {}", self.current, next);
            self.current = next;
            self.counter = 0;
        }
        (next, task)
    }
}

pub async fn run_tick_loop(ctx: NodeContext, mut dispatcher: Dispatcher) {
    let mut machine = TickMachine::new(&ctx.config);
    let mut ticker = interval(ctx.config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(bue_id = ctx.ota.id(), "tick loop started");

    while !ctx.shutdown.is_triggered() {
        ticker.tick().await;

        for msg in ctx.ota.get_new_messages() {
            dispatcher.handle(msg);
        }
        dispatcher.reap();

        let snapshot = ctx.state.lock().snapshot();
        let (next, task) = machine.step(&snapshot);
        if let Some(task) = task {
            ctx.enqueue(task);
        }
        if next != snapshot.lifecycle {
            ctx.state.lock().enter(next);
        }
    }

    dispatcher.shutdown().await;
    debug!(state = %machine.current(), "tick loop stopped");
}
