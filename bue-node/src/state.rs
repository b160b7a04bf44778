//! Node connection state: the single record every task reads and the
//! dispatcher, tick loop and worker mutate under one lock.

use crate::execution::JobHandle;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    Connecting,
    Idle,
    Testing,
}

impl Lifecycle {
    /// Name reported in the `PING` body.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Init => "INIT",
            Lifecycle::Connecting => "CONNECTING",
            Lifecycle::Idle => "IDLE",
            Lifecycle::Testing => "TESTING",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of counting one outgoing ping against the missed-reply budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Warning,
    Lost,
}

/// Read-only copy handed to the tick machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub lifecycle: Lifecycle,
    pub peer_base_id: Option<u16>,
    pub missed_liveness: u32,
    pub has_job: bool,
}

#[derive(Debug)]
pub struct NodeConnectionState {
    pub own_id: u16,
    pub hostname: String,
    pub peer_base_id: Option<u16>,
    pub lifecycle: Lifecycle,
    pub missed_liveness: u32,
    awaiting_pingr: bool,
    pub active_job: Option<JobHandle>,
}

impl NodeConnectionState {
    pub fn new(own_id: u16, hostname: String) -> Self {
        Self {
            own_id,
            hostname,
            peer_base_id: None,
            lifecycle: Lifecycle::Init,
            missed_liveness: 0,
            awaiting_pingr: false,
            active_job: None,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            lifecycle: self.lifecycle,
            peer_base_id: self.peer_base_id,
            missed_liveness: self.missed_liveness,
            has_job: self.active_job.is_some(),
        }
    }

    pub fn accept_connection(&mut self, base_id: u16) {
        self.peer_base_id = Some(base_id);
        self.missed_liveness = 0;
        self.awaiting_pingr = false;
    }

    pub fn clear_connection(&mut self) {
        self.peer_base_id = None;
        self.missed_liveness = 0;
        self.awaiting_pingr = false;
    }

    pub fn record_pingr(&mut self) {
        self.missed_liveness = 0;
        self.awaiting_pingr = false;
    }

    /// Called right before a `PING` goes out. A ping sent while the previous
    /// one is still unanswered counts as one miss.
    pub fn register_ping(&mut self, max_missed: u32) -> Liveness {
        if self.awaiting_pingr {
            self.missed_liveness += 1;
        }
        self.awaiting_pingr = true;

        if self.missed_liveness >= max_missed {
            Liveness::Lost
        } else if self.missed_liveness > 0 && self.missed_liveness >= max_missed / 2 {
            Liveness::Warning
        } else {
            Liveness::Healthy
        }
    }

    /// Applies a lifecycle transition. Falling back to `Connecting` drops
    /// the current peer.
    pub fn enter(&mut self, next: Lifecycle) {
        if next == Lifecycle::Connecting {
            self.clear_connection();
        }
        self.lifecycle = next;
    }

    /// Clears the active job if it is still `job_id`.
    pub fn finish_job(&mut self, job_id: Uuid) -> bool {
        match &self.active_job {
            Some(job) if job.id == job_id => {
                self.active_job = None;
                true
            }
            _ => false,
        }
    }
}
