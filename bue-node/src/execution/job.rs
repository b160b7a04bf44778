//! Test job descriptor, phases and the shared output buffer.

use crate::state::{new_state, Shared};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed test job: {0:?}")]
    Malformed(String),
    #[error("invalid start timestamp: {0:?}")]
    BadTimestamp(String),
    #[error("failed to launch {script}: {source}")]
    Launch {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("I/O error while supervising job: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed `TEST` body: `<script>,<start_unix_ts>,<space separated params>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestJob {
    pub script: String,
    pub start_ts: i64,
    pub scheduled_start: OffsetDateTime,
    pub params: Vec<String>,
}

impl TestJob {
    pub fn parse(body: &str) -> Result<Self, JobError> {
        let parts: Vec<&str> = body.split(',').collect();
        let [script, ts, params] = parts.as_slice() else {
            return Err(JobError::Malformed(body.to_string()));
        };

        let script = script.trim();
        if script.is_empty() || script.contains('/') || script.contains("..") {
            return Err(JobError::Malformed(body.to_string()));
        }

        let start_ts: i64 = ts
            .trim()
            .parse()
            .map_err(|_| JobError::BadTimestamp(ts.to_string()))?;
        let scheduled_start = OffsetDateTime::from_unix_timestamp(start_ts)
            .map_err(|_| JobError::BadTimestamp(ts.to_string()))?;

        Ok(Self {
            script: script.to_string(),
            start_ts,
            scheduled_start,
            params: params.split_whitespace().map(String::from).collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Scheduled,
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Scheduled => "scheduled",
            JobPhase::Waiting => "waiting",
            JobPhase::Running => "running",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Captured output lines waiting to be relayed upstream. Full buffer drops
/// the oldest line.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            if let Some(dropped) = self.lines.pop_front() {
                warn!(%dropped, "output buffer full, dropping oldest line");
            }
        }
        self.lines.push_back(line);
    }

    /// Takes every buffered line, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Handle to the active job shared between the dispatcher, the worker and
/// the supervisor task.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    pub script: String,
    cancel: Arc<AtomicBool>,
    output: Shared<OutputBuffer>,
    phase: Shared<JobPhase>,
}

impl JobHandle {
    pub fn new(script: &str, output_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            script: script.to_string(),
            cancel: Arc::new(AtomicBool::new(false)),
            output: new_state(OutputBuffer::new(output_capacity)),
            phase: new_state(JobPhase::Scheduled),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: JobPhase) {
        *self.phase.lock() = phase;
    }

    pub fn record(&self, line: String) {
        self.output.lock().push(line);
    }

    pub fn drain_output(&self) -> Vec<String> {
        self.output.lock().drain()
    }
}
