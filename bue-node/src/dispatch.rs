//! Routes every inbound message through one place so the connection state
//! only ever changes in response to a message or a tick.

use crate::context::NodeContext;
use crate::execution::{self, JobHandle, TestJob};
use crate::state::Lifecycle;
use crate::worker::Task;
use bue_ota::{Message, MessageType};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    ctx: NodeContext,
    jobs: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            jobs: JoinSet::new(),
        }
    }

    pub fn handle(&mut self, msg: Message) {
        let bue_id = self.ctx.ota.id();
        match msg.kind {
            MessageType::Con => self.handle_con(&msg),
            MessageType::Pingr => {
                if self.from_peer(&msg) {
                    self.ctx.state.lock().record_pingr();
                    debug!(bue_id, base_id = msg.source_id, "got PINGR");
                }
            }
            MessageType::Test => self.handle_test(&msg),
            MessageType::Canc => {
                if !self.from_peer(&msg) {
                    return;
                }
                if self.ctx.state.lock().active_job.is_some() {
                    info!(bue_id, "received CANC");
                    self.ctx.enqueue(Task::Interrupt);
                } else {
                    warn!(bue_id, "received CANC with no active test, ignoring");
                }
            }
            MessageType::Reload => {
                if self.from_peer(&msg) {
                    info!(bue_id, "received RELOAD");
                    self.ctx.enqueue(Task::Reload);
                }
            }
            MessageType::Restart => {
                if self.from_peer(&msg) {
                    info!(bue_id, "received RESTART");
                    self.ctx.enqueue(Task::Restart);
                }
            }
            MessageType::Ack => debug!(bue_id, source_id = msg.source_id, "got ACK"),
            ref other => warn!(bue_id, source_id = msg.source_id, kind = %other, "unexpected message type, ignoring"),
        }
    }

    fn from_peer(&self, msg: &Message) -> bool {
        let peer = self.ctx.peer();
        if peer == Some(msg.source_id) {
            true
        } else {
            warn!(
                bue_id = self.ctx.ota.id(),
                source_id = msg.source_id,
                ?peer,
                kind = %msg.kind,
                "message from a station we are not connected to, ignoring"
            );
            false
        }
    }

    fn handle_con(&mut self, msg: &Message) {
        let bue_id = self.ctx.ota.id();
        let base_id = match msg.body().trim().parse::<u16>() {
            Ok(id) if id == msg.source_id => id,
            Ok(id) => {
                warn!(bue_id, source_id = msg.source_id, body_id = id, "CON id mismatch, ignoring");
                return;
            }
            Err(_) => {
                warn!(bue_id, source_id = msg.source_id, body = msg.body(), "malformed CON body, ignoring");
                return;
            }
        };

        {
            let mut state = self.ctx.state.lock();
            if state.lifecycle != Lifecycle::Connecting || state.peer_base_id.is_some() {
                debug!(bue_id, base_id, "not looking for a base station, ignoring CON");
                return;
            }
            state.accept_connection(base_id);
        }
        self.ctx.ota.send(base_id, MessageType::Ack, None);
        info!(bue_id, base_id, "connected to base station");
    }

    fn handle_test(&mut self, msg: &Message) {
        if !self.from_peer(msg) {
            return;
        }
        let bue_id = self.ctx.ota.id();
        let base_id = msg.source_id;

        if self.ctx.state.lock().active_job.is_some() {
            warn!(bue_id, "TEST received while a job is already running, rejecting");
            self.ctx.ota.send(base_id, MessageType::Fail, None);
            return;
        }

        let job = match TestJob::parse(msg.body()) {
            Ok(job) => job,
            Err(e) => {
                warn!(bue_id, body = msg.body(), "malformed test job: {}", e);
                self.ctx.ota.send(base_id, MessageType::Fail, None);
                return;
            }
        };

        let handle = JobHandle::new(&job.script, self.ctx.config.output_buffer_lines);
        self.ctx.state.lock().active_job = Some(handle.clone());
        self.jobs
            .spawn(execution::supervise(self.ctx.clone(), handle, job, base_id));
    }

    /// Collects finished supervisor tasks.
    pub fn reap(&mut self) {
        while let Some(result) = self.jobs.try_join_next() {
            if let Err(e) = result {
                error!("test supervisor task failed: {}", e);
                self.ctx.state.lock().active_job = None;
            }
        }
    }

    /// Cancels the running job, if any, and waits for its supervisor.
    pub async fn shutdown(mut self) {
        if let Some(job) = self.ctx.state.lock().active_job.as_ref() {
            job.cancel();
        }
        while let Some(result) = self.jobs.join_next().await {
            if let Err(e) = result {
                error!("test supervisor task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lifecycle;
    use crate::testing::{connected_node, node};
    use std::time::Duration;

    fn msg(source_id: u16, payload: &str) -> Message {
        Message::from_payload(source_id, payload)
    }

    #[tokio::test]
    async fn test_con_accepted_while_connecting() {
        let (mut harness, ctx, _rx) = node(10);
        ctx.state.lock().enter(Lifecycle::Connecting);
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(1, "CON:1"));

        assert_eq!(ctx.peer(), Some(1));
        harness.assert_sent(1, "ACK").unwrap();
    }

    #[tokio::test]
    async fn test_con_id_mismatch_is_ignored() {
        let (mut harness, ctx, _rx) = node(10);
        ctx.state.lock().enter(Lifecycle::Connecting);
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(1, "CON:2"));
        dispatcher.handle(msg(1, "CON:base"));

        assert_eq!(ctx.peer(), None);
        assert!(harness.flush().is_empty());
    }

    #[tokio::test]
    async fn test_pingr_only_counts_from_peer() {
        let (_harness, ctx, _rx) = connected_node(10, 1);
        ctx.state.lock().missed_liveness = 3;
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(7, "PINGR"));
        assert_eq!(ctx.state.lock().missed_liveness, 3);

        dispatcher.handle(msg(1, "PINGR"));
        assert_eq!(ctx.state.lock().missed_liveness, 0);
    }

    #[tokio::test]
    async fn test_malformed_test_reports_fail() {
        let (mut harness, ctx, _rx) = connected_node(10, 1);
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(1, "TEST:helloworld,1745004290"));

        harness.assert_sent(1, "FAIL").unwrap();
        assert!(ctx.state.lock().active_job.is_none());
    }

    #[tokio::test]
    async fn test_second_test_is_rejected() {
        let (mut harness, ctx, _rx) = connected_node(10, 1);
        ctx.state.lock().active_job = Some(JobHandle::new("busy", 8));
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(1, "TEST:helloworld,0,"));

        harness.assert_sent(1, "FAIL").unwrap();
        assert_eq!(ctx.state.lock().active_job.as_ref().map(|j| j.script.clone()), Some("busy".into()));
    }

    #[tokio::test]
    async fn test_accepted_test_starts_job_and_cancel_stops_it() {
        let (mut harness, ctx, mut rx) = connected_node(10, 1);
        let mut dispatcher = Dispatcher::new(ctx.clone());
        let start = time::OffsetDateTime::now_utc().unix_timestamp() + 60;

        dispatcher.handle(msg(1, &format!("TEST:helloworld,{start},-v")));
        assert!(ctx.state.lock().active_job.is_some());

        dispatcher.handle(msg(1, "CANC"));
        assert_eq!(rx.try_recv().ok(), Some(Task::Interrupt));
        crate::worker::execute(&ctx, Task::Interrupt).await;

        tokio::time::timeout(Duration::from_secs(2), dispatcher.shutdown())
            .await
            .unwrap();
        let sent: Vec<String> = harness.flush().into_iter().map(|f| f.payload).collect();
        assert_eq!(sent, vec![format!("PREPR:{start}"), "CANCD".to_string()]);
        assert!(ctx.state.lock().active_job.is_none());
    }

    #[tokio::test]
    async fn test_canc_without_job_and_service_commands() {
        let (_harness, ctx, mut rx) = connected_node(10, 1);
        let mut dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.handle(msg(1, "CANC"));
        dispatcher.handle(msg(1, "RELOAD"));
        dispatcher.handle(msg(9, "RESTART"));
        dispatcher.handle(msg(1, "RESTART"));
        dispatcher.handle(msg(1, "BOGUS:1"));

        assert_eq!(rx.try_recv().ok(), Some(Task::Reload));
        assert_eq!(rx.try_recv().ok(), Some(Task::Restart));
        assert!(rx.try_recv().is_err());
    }
}
