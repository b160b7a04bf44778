//! Reactive side of the base station: turns inbound frames into roster
//! updates and replies, and exposes the operator actions.

use crate::geo::haversine_m;
use crate::roster::{Coordinates, RosterEntry, RosterError};
use crate::state::SharedRoster;
use bue_ota::{Message, MessageType, Ota, Shutdown};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StationError {
    #[error("bUE {0} is not connected")]
    NotConnected(u16),
    #[error("no position known for bUE {0}")]
    NoPosition(u16),
    #[error("invalid {0}")]
    InvalidField(&'static str),
}

impl From<RosterError> for StationError {
    fn from(e: RosterError) -> Self {
        match e {
            RosterError::NotConnected(id) => StationError::NotConnected(id),
        }
    }
}

#[derive(Clone)]
pub struct BaseStation {
    ota: Ota,
    roster: SharedRoster,
}

impl BaseStation {
    pub fn new(ota: Ota, roster: SharedRoster) -> Self {
        Self { ota, roster }
    }

    pub fn id(&self) -> u16 {
        self.ota.id()
    }

    pub fn roster(&self) -> &SharedRoster {
        &self.roster
    }

    pub fn handle_message(&self, msg: Message) {
        let bue_id = msg.source_id;
        match msg.kind {
            MessageType::Req => self.handle_req(&msg),
            MessageType::Ack => {
                if self.roster.lock().acknowledge(bue_id, Instant::now()) {
                    info!(bue_id, "bUE connected");
                } else {
                    debug!(bue_id, "duplicate ACK");
                }
            }
            MessageType::Ping => self.handle_ping(&msg),
            MessageType::Upd => self.handle_upd(&msg),
            MessageType::Prepr => info!(bue_id, start_ts = msg.body(), "bUE preparing test"),
            MessageType::Done => self.finish_test(bue_id, "test completed"),
            MessageType::Fail => self.finish_test(bue_id, "test failed"),
            MessageType::Cancd => self.finish_test(bue_id, "test cancelled"),
            MessageType::Tout => self.finish_test(bue_id, "test timed out"),
            ref other => warn!(bue_id, kind = %other, "unexpected message type, ignoring"),
        }
    }

    fn handle_req(&self, msg: &Message) {
        let bue_id = msg.source_id;
        let Some((hostname, claimed)) = msg.body().rsplit_once(',') else {
            warn!(bue_id, body = msg.body(), "malformed REQ body, ignoring");
            return;
        };
        if claimed.trim().parse::<u16>().ok() != Some(bue_id) {
            warn!(bue_id, claimed, "REQ id mismatch, ignoring");
            return;
        }

        let hostname = hostname.trim();
        self.roster.lock().record_request(bue_id, hostname);
        self.ota.send(bue_id, MessageType::Con, Some(&self.ota.id().to_string()));
        info!(bue_id, hostname, "connection request, sent CON");
    }

    fn handle_ping(&self, msg: &Message) {
        let bue_id = msg.source_id;
        let mut fields = msg.body().splitn(3, ',');
        let state = fields.next().unwrap_or_default();
        let lat = fields.next().unwrap_or_default();
        let lon = fields.next().unwrap_or_default();

        match self.roster.lock().record_ping(bue_id, state, lat, lon, Instant::now()) {
            Ok(()) => {
                self.ota.send(bue_id, MessageType::Pingr, None);
                debug!(bue_id, state, lat, lon, "PING");
            }
            Err(e) => error!(bue_id, "PING rejected: {}", e),
        }
    }

    fn handle_upd(&self, msg: &Message) {
        let bue_id = msg.source_id;
        let mut fields = msg.body().splitn(3, ',');
        let lat = fields.next().unwrap_or_default();
        let lon = fields.next().unwrap_or_default();
        let line = fields.next().unwrap_or_default();

        match self.roster.lock().record_update(bue_id, lat, lon, Instant::now()) {
            Ok(()) => info!(bue_id, lat, lon, "UPD: {}", line),
            Err(e) => warn!(bue_id, "UPD rejected: {}", e),
        }
    }

    fn finish_test(&self, bue_id: u16, outcome: &str) {
        info!(bue_id, "{}", outcome);
        if let Err(e) = self.roster.lock().set_testing(bue_id, false) {
            debug!(bue_id, "{}", e);
        }
    }

    fn ensure_connected(&self, id: u16) -> Result<(), StationError> {
        if self.roster.lock().contains(id) {
            Ok(())
        } else {
            Err(StationError::NotConnected(id))
        }
    }

    /// Schedules `script` on every bUE in `ids`, `delay_secs` from now.
    /// Nothing is sent unless every id is connected. Returns the start time.
    pub fn send_test(&self, ids: &[u16], script: &str, delay_secs: u64, params: &[String]) -> Result<i64, StationError> {
        if script.is_empty() || script.contains(',') {
            return Err(StationError::InvalidField("script"));
        }
        if params.iter().any(|p| p.contains(',')) {
            return Err(StationError::InvalidField("parameters"));
        }
        let start = i64::try_from(delay_secs)
            .ok()
            .and_then(|delay| OffsetDateTime::now_utc().unix_timestamp().checked_add(delay))
            .ok_or(StationError::InvalidField("delay"))?;
        let body = format!("{},{},{}", script, start, params.join(" "));

        let mut roster = self.roster.lock();
        if let Some(&missing) = ids.iter().find(|&&id| !roster.contains(id)) {
            return Err(StationError::NotConnected(missing));
        }
        for &id in ids {
            roster.set_testing(id, true)?;
            self.ota.send(id, MessageType::Test, Some(&body));
            info!(bue_id = id, script, start, "sent TEST");
        }
        Ok(start)
    }

    pub fn cancel_test(&self, id: u16) -> Result<(), StationError> {
        self.ensure_connected(id)?;
        self.ota.send(id, MessageType::Canc, None);
        info!(bue_id = id, "sent CANC");
        Ok(())
    }

    /// Asks the bUE to restart its service, then drops it from the roster.
    pub fn reload(&self, id: u16) -> Result<RosterEntry, StationError> {
        self.ensure_connected(id)?;
        self.ota.send(id, MessageType::Reload, None);
        self.disconnect(id)
    }

    /// Asks the bUE to reboot, then drops it from the roster.
    pub fn restart(&self, id: u16) -> Result<RosterEntry, StationError> {
        self.ensure_connected(id)?;
        self.ota.send(id, MessageType::Restart, None);
        self.disconnect(id)
    }

    pub fn disconnect(&self, id: u16) -> Result<RosterEntry, StationError> {
        let entry = self.roster.lock().disconnect(id).ok_or(StationError::NotConnected(id))?;
        info!(bue_id = id, hostname = %entry.hostname, "bUE disconnected");
        Ok(entry)
    }

    /// Metres between the last known positions of `a` and `b`.
    pub fn distance(&self, a: u16, b: u16) -> Result<f64, StationError> {
        let roster = self.roster.lock();
        let position = |id: u16| -> Result<Coordinates, StationError> {
            roster
                .get(id)
                .ok_or(StationError::NotConnected(id))?
                .last_position
                .ok_or(StationError::NoPosition(id))
        };
        let (pa, pb) = (position(a)?, position(b)?);
        Ok(haversine_m(pa.lat, pa.lon, pb.lat, pb.lon))
    }

    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.roster.lock().snapshot()
    }
}

/// Drains the inbound queue every `poll` until shutdown.
pub fn spawn_message_listener(station: BaseStation, poll: Duration, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        while !shutdown.is_triggered() {
            interval.tick().await;
            for msg in station.ota.get_new_messages() {
                station.handle_message(msg);
            }
        }
        debug!("message listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Roster;
    use crate::state::new_state;
    use bue_devkit::TestHarness;

    fn station() -> (TestHarness, BaseStation) {
        let harness = TestHarness::new(1);
        let station = BaseStation::new(harness.ota.clone(), new_state(Roster::new()));
        (harness, station)
    }

    fn deliver(harness: &mut TestHarness, station: &BaseStation) {
        for msg in harness.deliver() {
            station.handle_message(msg);
        }
    }

    fn connect(harness: &mut TestHarness, station: &BaseStation, id: u16) {
        harness.inject(id, &format!("REQ:bue-{id},{id}"));
        harness.inject(id, "ACK");
        deliver(harness, station);
    }

    #[test]
    fn test_happy_path() {
        let (mut harness, station) = station();

        harness.inject(10, "REQ:host-1,10");
        deliver(&mut harness, &station);
        harness.assert_sent(10, "CON:1").unwrap();
        assert!(station.snapshot().is_empty());

        harness.inject(10, "ACK");
        deliver(&mut harness, &station);
        let entries = station.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 10);
        assert_eq!(entries[0].hostname, "host-1");
        assert!(entries[0].connected);

        harness.inject(10, "PING:IDLE,40.0,-111.0");
        deliver(&mut harness, &station);
        harness.assert_sent(10, "PINGR").unwrap();
        let entry = station.roster().lock().get(10).cloned().unwrap();
        assert_eq!(entry.reported_state, "IDLE");
        assert_eq!(entry.last_position, Some(Coordinates { lat: 40.0, lon: -111.0 }));
    }

    #[test]
    fn test_req_id_mismatch_is_ignored() {
        let (mut harness, station) = station();
        harness.inject(10, "REQ:host-1,11");
        harness.inject(10, "REQ:no-id");
        deliver(&mut harness, &station);
        assert!(harness.flush().is_empty());
    }

    #[test]
    fn test_ping_from_unknown_bue_gets_no_reply() {
        let (mut harness, station) = station();
        harness.inject(12, "PING:IDLE,,");
        deliver(&mut harness, &station);
        assert!(harness.flush().is_empty());
        assert!(station.snapshot().is_empty());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (mut harness, _station) = station();
        harness.channel.simulate_incoming("+RCV=1,5,HELLO");
        assert!(harness.deliver().is_empty());
    }

    #[test]
    fn test_test_lifecycle_marks_entry() {
        let (mut harness, station) = station();
        connect(&mut harness, &station, 10);
        connect(&mut harness, &station, 11);
        harness.clear();

        let params = vec!["-f".to_string(), "915".to_string()];
        let start = station.send_test(&[10, 11], "helloworld", 30, &params).unwrap();
        let body = format!("TEST:helloworld,{start},-f 915");
        harness.assert_sent(10, &body).unwrap();
        harness.assert_sent(11, &body).unwrap();
        assert!(station.snapshot().iter().all(|e| e.testing));

        harness.inject(10, &format!("PREPR:{start}"));
        harness.inject(10, "UPD:40.1,-111.1,STDOUT: [helloworld STDOUT] rx msg: hi");
        harness.inject(10, "DONE");
        harness.inject(11, "CANCD");
        deliver(&mut harness, &station);

        let roster = station.roster().lock();
        assert!(!roster.get(10).unwrap().testing);
        assert!(!roster.get(11).unwrap().testing);
        assert_eq!(roster.get(10).unwrap().last_position, Some(Coordinates { lat: 40.1, lon: -111.1 }));
    }

    #[test]
    fn test_send_test_requires_all_connected() {
        let (mut harness, station) = station();
        connect(&mut harness, &station, 10);
        harness.clear();

        assert_eq!(station.send_test(&[10, 42], "helloworld", 0, &[]), Err(StationError::NotConnected(42)));
        assert_eq!(
            station.send_test(&[10], "a,b", 0, &[]),
            Err(StationError::InvalidField("script"))
        );
        assert!(harness.flush().is_empty());
        assert!(!station.snapshot()[0].testing);
    }

    #[test]
    fn test_send_test_rejects_unrepresentable_delay() {
        let (mut harness, station) = station();
        connect(&mut harness, &station, 10);
        harness.clear();

        let overflow = i64::MAX as u64;
        assert_eq!(station.send_test(&[10], "helloworld", overflow, &[]), Err(StationError::InvalidField("delay")));
        assert_eq!(station.send_test(&[10], "helloworld", u64::MAX, &[]), Err(StationError::InvalidField("delay")));
        assert!(harness.flush().is_empty());
        assert!(!station.snapshot()[0].testing);
    }

    #[test]
    fn test_reload_and_restart_disconnect() {
        let (mut harness, station) = station();
        connect(&mut harness, &station, 10);
        connect(&mut harness, &station, 11);

        station.reload(10).unwrap();
        station.restart(11).unwrap();
        harness.assert_sent(10, "RELOAD").unwrap();
        harness.assert_sent(11, "RESTART").unwrap();
        assert!(station.snapshot().is_empty());
        assert_eq!(station.cancel_test(10), Err(StationError::NotConnected(10)));
        assert!(station.disconnect(10).is_err());
    }

    #[test]
    fn test_distance_between_bues() {
        let (mut harness, station) = station();
        connect(&mut harness, &station, 10);
        connect(&mut harness, &station, 11);
        assert_eq!(station.distance(10, 11), Err(StationError::NoPosition(10)));

        harness.inject(10, "PING:IDLE,0.0,0.0");
        harness.inject(11, "PING:IDLE,0.0,1.0");
        deliver(&mut harness, &station);

        let d = station.distance(10, 11).unwrap();
        assert!((d - 111_195.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_listener_handles_frames() {
        let (mut harness, station) = station();
        let shutdown = Shutdown::new();
        let listener = spawn_message_listener(station.clone(), Duration::from_millis(5), shutdown.clone());

        harness.inject(10, "REQ:host-1,10");
        harness.inject(10, "ACK");
        harness.pump_all();
        tokio::time::timeout(Duration::from_secs(2), async {
            while station.snapshot().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        harness.assert_sent(10, "CON:1").unwrap();

        shutdown.trigger();
        listener.await.unwrap();
    }
}
