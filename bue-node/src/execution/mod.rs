//! Test job supervisor
//!
//! Runs one accepted `TEST` to completion: acknowledge with `PREPR`, wait
//! (cancellably) for the scheduled start, run the script with both output
//! streams captured, then report `DONE`, `FAIL` or `CANCD` to the base.

pub mod job;

pub use job::{JobError, JobHandle, JobPhase, OutputBuffer, TestJob};

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::worker::flush_output;
use bue_ota::{MessageType, Shutdown};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const WAIT_STEP: Duration = Duration::from_millis(1);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STREAM_QUEUE_CAPACITY: usize = 64;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

enum Outcome {
    /// Cancelled before or while running; carries the interrupted child.
    Cancelled(Option<Child>),
    Exited(Option<i32>),
}

/// `<runner...> <TEST_DIR>/<script><suffix> <params...>` with piped output.
pub fn command_for(config: &NodeConfig, job: &TestJob) -> Command {
    let script = Path::new(&config.test_dir).join(format!("{}{}", job.script, config.test_script_suffix));
    let mut command = match config.test_runner.split_first() {
        Some((runner, args)) => {
            let mut command = Command::new(runner);
            command.args(args).arg(&script);
            command
        }
        None => Command::new(&script),
    };
    command
        .args(&job.params)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

pub async fn supervise(ctx: NodeContext, handle: JobHandle, job: TestJob, base_id: u16) {
    info!(job_id = %handle.id, script = %job.script, start_ts = job.start_ts, "test job accepted");

    let mut interrupted = None;
    match run(&ctx, &handle, &job, base_id).await {
        Ok(Outcome::Cancelled(child)) => {
            handle.set_phase(JobPhase::Cancelled);
            info!(job_id = %handle.id, "test job cancelled");
            ctx.ota.send(base_id, MessageType::Cancd, None);
            interrupted = child;
        }
        Ok(Outcome::Exited(Some(0))) => {
            let position = ctx.position().await;
            flush_output(&ctx, base_id, &position, handle.drain_output()).await;
            handle.set_phase(JobPhase::Completed);
            info!(job_id = %handle.id, "{} completed successfully", job.script);
            ctx.ota.send(base_id, MessageType::Done, None);
        }
        Ok(Outcome::Exited(code)) => {
            handle.set_phase(JobPhase::Failed);
            error!(job_id = %handle.id, ?code, "{} exited with failure", job.script);
            ctx.ota.send(base_id, MessageType::Fail, None);
        }
        Err(e) => {
            handle.set_phase(JobPhase::Failed);
            error!(job_id = %handle.id, "test could not be run: {}", e);
            ctx.ota.send(base_id, MessageType::Fail, None);
        }
    }

    if let Some(child) = interrupted {
        reap(child, &job.script).await;
    }
    ctx.state.lock().finish_job(handle.id);
}

async fn run(ctx: &NodeContext, handle: &JobHandle, job: &TestJob, base_id: u16) -> Result<Outcome, JobError> {
    ctx.ota.send(base_id, MessageType::Prepr, Some(&job.start_ts.to_string()));

    handle.set_phase(JobPhase::Waiting);
    if !wait_for_start(handle, job.scheduled_start, &ctx.shutdown).await {
        info!(job_id = %handle.id, "test cancelled during wait period");
        return Ok(Outcome::Cancelled(None));
    }

    handle.set_phase(JobPhase::Running);
    let mut child = command_for(&ctx.config, job)
        .spawn()
        .map_err(|source| JobError::Launch {
            script: job.script.clone(),
            source,
        })?;
    info!(pid = ?child.id(), params = ?job.params, "started test script {}", job.script);

    let stdout = child.stdout.take().ok_or(JobError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(JobError::MissingPipe("stderr"))?;
    let (out_tx, mut out_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (err_tx, mut err_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let readers = [
        tokio::spawn(forward_lines(stdout, out_tx)),
        tokio::spawn(forward_lines(stderr, err_tx)),
    ];

    let marker = ctx.config.output_marker.as_str();
    let polled = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(Some(status)),
            Ok(None) => {}
            Err(e) => break Err(JobError::Io(e)),
        }

        if let Ok(line) = out_rx.try_recv() {
            record_stdout(handle, &job.script, marker, &line);
        }
        if let Ok(line) = err_rx.try_recv() {
            record_stderr(handle, &job.script, &line);
        }

        if handle.is_cancelled() || ctx.shutdown.is_triggered() {
            info!(job_id = %handle.id, "sending interrupt to {}", job.script);
            if let Err(e) = interrupt(&child) {
                error!("failed to interrupt {}: {}", job.script, e);
            }
            break Ok(None);
        }
        sleep(POLL_INTERVAL).await;
    };

    let outcome = match polled {
        Ok(Some(status)) => {
            let _ = timeout(STDERR_DRAIN_TIMEOUT, async {
                while let Some(line) = err_rx.recv().await {
                    record_stderr(handle, &job.script, &line);
                }
            })
            .await;
            if handle.is_cancelled() {
                Ok(Outcome::Cancelled(None))
            } else {
                Ok(Outcome::Exited(status.code()))
            }
        }
        Ok(None) => {
            while let Ok(line) = err_rx.try_recv() {
                record_stderr(handle, &job.script, &line);
            }
            Ok(Outcome::Cancelled(Some(child)))
        }
        Err(e) => Err(e),
    };

    drop(out_rx);
    drop(err_rx);
    for reader in readers {
        reader.abort();
        let _ = reader.await;
    }
    outcome
}

/// Sleeps in short steps until `start`. Returns `false` if the job was
/// cancelled (or the node is shutting down) first.
async fn wait_for_start(handle: &JobHandle, start: OffsetDateTime, shutdown: &Shutdown) -> bool {
    let now = OffsetDateTime::now_utc();
    if start > now {
        info!(wait_secs = (start - now).whole_seconds(), "waiting for scheduled start");
    }
    while OffsetDateTime::now_utc() < start {
        if handle.is_cancelled() || shutdown.is_triggered() {
            return false;
        }
        sleep(WAIT_STEP).await;
    }
    !handle.is_cancelled()
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, lines_tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if lines_tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("output stream read failed: {}", e);
                break;
            }
        }
    }
}

fn record_stdout(handle: &JobHandle, script: &str, marker: &str, line: &str) {
    let clean = format!("[{} STDOUT] {}", script, line.trim());
    info!("{}", clean);
    if clean.contains(marker) {
        handle.record(format!("STDOUT: {clean}"));
    }
}

fn record_stderr(handle: &JobHandle, script: &str, line: &str) {
    let clean = format!("[{} STDERR] {}", script, line.trim());
    warn!("{}", clean);
    handle.record(format!("STDERR: {clean}"));
}

fn interrupt(child: &Child) -> Result<(), JobError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(|errno| JobError::Io(errno.into()))
}

/// Waits for an interrupted script, killing it if it ignores the interrupt.
async fn reap(mut child: Child, script: &str) {
    match timeout(INTERRUPT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "{} exited after interrupt", script),
        Ok(Err(e)) => warn!("failed to wait for {}: {}", script, e),
        Err(_) => {
            warn!("{} ignored interrupt, killing it", script);
            if let Err(e) = child.kill().await {
                error!("failed to kill {}: {}", script, e);
            }
        }
    }
}
