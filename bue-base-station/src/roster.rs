/*!
 * FLEET ROSTER - One entry per connected bUE
 *
 * Entries are created when a bUE acknowledges the connection and removed only
 * by an explicit disconnect. The liveness sweep ages silent entries but never
 * deletes them.
 */

use crate::state::SharedRoster;
use bue_ota::Shutdown;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);
pub const UNKNOWN_HOSTNAME: &str = "unknown";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("bUE {0} is not connected")]
    NotConnected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Parses a reported position; empty or unreadable fields give `None`.
    pub fn parse(lat: &str, lon: &str) -> Option<Self> {
        let (lat, lon) = (lat.trim(), lon.trim());
        if lat.is_empty() || lon.is_empty() {
            return None;
        }
        Some(Self {
            lat: lat.parse().ok()?,
            lon: lon.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    pub id: u16,
    pub hostname: String,
    pub connected: bool,
    #[serde(skip)]
    pub last_seen: Instant,
    pub missed_liveness_count: u32,
    pub reported_state: String,
    pub last_position: Option<Coordinates>,
    pub testing: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
}

impl RosterEntry {
    fn heard_from(&mut self, now: Instant) {
        self.last_seen = now;
        self.missed_liveness_count = 0;
    }

    fn update_position(&mut self, lat: &str, lon: &str) {
        if let Some(position) = Coordinates::parse(lat, lon) {
            self.last_position = Some(position);
        } else if !lat.trim().is_empty() && !lon.trim().is_empty() {
            warn!(bue_id = self.id, lat, lon, "unreadable position, keeping last known");
        }
    }
}

#[derive(Debug, Default)]
pub struct Roster {
    entries: BTreeMap<u16, RosterEntry>,
    /// Hostnames announced in `REQ` frames not yet acknowledged.
    pending: HashMap<u16, String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self, id: u16, hostname: &str) {
        self.pending.insert(id, hostname.to_string());
    }

    /// Creates the entry for `id` on its first `ACK`. A repeated `ACK` only
    /// refreshes liveness. Returns `true` when a new entry was created.
    pub fn acknowledge(&mut self, id: u16, now: Instant) -> bool {
        let hostname = self.pending.remove(&id);
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(hostname) = hostname {
                entry.hostname = hostname;
            }
            entry.heard_from(now);
            return false;
        }

        self.entries.insert(
            id,
            RosterEntry {
                id,
                hostname: hostname.unwrap_or_else(|| UNKNOWN_HOSTNAME.to_string()),
                connected: true,
                last_seen: now,
                missed_liveness_count: 0,
                reported_state: String::new(),
                last_position: None,
                testing: false,
                connected_at: OffsetDateTime::now_utc(),
            },
        );
        true
    }

    pub fn record_ping(&mut self, id: u16, state: &str, lat: &str, lon: &str, now: Instant) -> Result<(), RosterError> {
        let entry = self.entries.get_mut(&id).ok_or(RosterError::NotConnected(id))?;
        entry.heard_from(now);
        entry.reported_state = state.to_string();
        entry.update_position(lat, lon);
        Ok(())
    }

    pub fn record_update(&mut self, id: u16, lat: &str, lon: &str, now: Instant) -> Result<(), RosterError> {
        let entry = self.entries.get_mut(&id).ok_or(RosterError::NotConnected(id))?;
        entry.heard_from(now);
        entry.update_position(lat, lon);
        Ok(())
    }

    pub fn set_testing(&mut self, id: u16, testing: bool) -> Result<(), RosterError> {
        let entry = self.entries.get_mut(&id).ok_or(RosterError::NotConnected(id))?;
        entry.testing = testing;
        Ok(())
    }

    /// Removes every trace of `id`.
    pub fn disconnect(&mut self, id: u16) -> Option<RosterEntry> {
        self.pending.remove(&id);
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&RosterEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies of all entries, ordered by id.
    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.entries.values().cloned().collect()
    }

    /// Counts one missed ping for each entry silent for `timeout`, at most
    /// once per timeout window. Returns `(id, missed count)` for each entry
    /// that was counted.
    pub fn sweep(&mut self, now: Instant, timeout: Duration, max_missed: u32) -> Vec<(u16, u32)> {
        let mut missed = Vec::new();
        for entry in self.entries.values_mut() {
            if now.saturating_duration_since(entry.last_seen) < timeout {
                continue;
            }
            entry.missed_liveness_count += 1;
            entry.last_seen = now;

            let count = entry.missed_liveness_count;
            if count >= max_missed {
                error!(bue_id = entry.id, missed = count, "bUE has missed too many pings, consider disconnecting");
            } else {
                warn!(bue_id = entry.id, missed = count, "missed a ping from bUE");
            }
            missed.push((entry.id, count));
        }
        missed
    }
}

/// Runs the liveness sweep every second until shutdown.
pub fn spawn_liveness_sweep(
    roster: SharedRoster,
    timeout: Duration,
    max_missed: u32,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    info!("starting liveness sweep (timeout: {:?}, max missed: {})", timeout, max_missed);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        while !shutdown.is_triggered() {
            interval.tick().await;
            roster.lock().sweep(Instant::now(), timeout, max_missed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn test_ack_twice_creates_one_entry() {
        let mut roster = Roster::new();
        let now = Instant::now();
        roster.record_request(10, "host-1");

        assert!(roster.acknowledge(10, now));
        assert!(!roster.acknowledge(10, now));
        assert_eq!(roster.len(), 1);

        let entry = roster.get(10).unwrap();
        assert_eq!(entry.hostname, "host-1");
        assert!(entry.connected);
        assert_eq!(entry.missed_liveness_count, 0);
    }

    #[test]
    fn test_ack_without_request_uses_placeholder_hostname() {
        let mut roster = Roster::new();
        roster.acknowledge(11, Instant::now());
        assert_eq!(roster.get(11).unwrap().hostname, UNKNOWN_HOSTNAME);
    }

    #[test]
    fn test_ping_requires_entry_and_updates_position() {
        let mut roster = Roster::new();
        let now = Instant::now();
        assert_eq!(
            roster.record_ping(10, "IDLE", "40.0", "-111.0", now),
            Err(RosterError::NotConnected(10))
        );

        roster.acknowledge(10, now);
        roster.record_ping(10, "IDLE", "40.0", "-111.0", now).unwrap();
        roster.record_ping(10, "TESTING", "", "", now).unwrap();

        let entry = roster.get(10).unwrap();
        assert_eq!(entry.reported_state, "TESTING");
        assert_eq!(entry.last_position, Some(Coordinates { lat: 40.0, lon: -111.0 }));
    }

    #[test]
    fn test_sweep_counts_once_per_window() {
        let mut roster = Roster::new();
        let start = Instant::now();
        roster.acknowledge(10, start);

        assert!(roster.sweep(start + Duration::from_secs(5), TIMEOUT, 3).is_empty());
        assert_eq!(roster.sweep(start + TIMEOUT, TIMEOUT, 3), vec![(10, 1)]);
        assert!(roster.sweep(start + TIMEOUT + Duration::from_secs(1), TIMEOUT, 3).is_empty());
        assert_eq!(roster.get(10).unwrap().missed_liveness_count, 1);

        assert_eq!(roster.sweep(start + TIMEOUT * 2, TIMEOUT, 3), vec![(10, 2)]);
    }

    #[test]
    fn test_sweep_never_removes_entries() {
        let mut roster = Roster::new();
        let start = Instant::now();
        roster.acknowledge(10, start);
        for window in 1..=5 {
            roster.sweep(start + TIMEOUT * window, TIMEOUT, 3);
        }
        assert_eq!(roster.get(10).unwrap().missed_liveness_count, 5);

        roster.record_ping(10, "IDLE", "", "", start + TIMEOUT * 5).unwrap();
        assert_eq!(roster.get(10).unwrap().missed_liveness_count, 0);
    }

    #[test]
    fn test_disconnect_removes_everything() {
        let mut roster = Roster::new();
        roster.record_request(10, "host-1");
        roster.acknowledge(10, Instant::now());
        roster.record_request(10, "host-1b");

        assert!(roster.disconnect(10).is_some());
        assert!(!roster.contains(10));
        roster.acknowledge(10, Instant::now());
        assert_eq!(roster.get(10).unwrap().hostname, UNKNOWN_HOSTNAME);
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_shutdown() {
        let roster = new_state(Roster::new());
        let shutdown = Shutdown::new();
        let task = spawn_liveness_sweep(roster, TIMEOUT, 3, shutdown.clone());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
    }
}
