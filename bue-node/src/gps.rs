//! Position source for `PING`/`UPD` bodies.
//!
//! The node only needs a best-effort latitude/longitude pair rendered as
//! strings; an empty pair means "no fix".

use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WATCH: &str = "?WATCH={\"enable\":true,\"json\":true};\n";
const READ_SLICE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub lat: String,
    pub lon: String,
}

impl Position {
    pub fn is_fix(&self) -> bool {
        !self.lat.is_empty() && !self.lon.is_empty()
    }
}

pub trait PositionSource: Send + Sync {
    /// Blocking lookup; returns an empty position when no fix is available.
    fn fix(&self) -> Position;
}

/// Source for nodes without a receiver.
pub struct NoFix;

impl PositionSource for NoFix {
    fn fix(&self) -> Position {
        Position::default()
    }
}

/// Averages TPV reports from a local gpsd.
pub struct GpsdSource {
    addr: String,
    timeout: Duration,
    min_fixes: usize,
}

#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// `(lat, lon)` from a gpsd TPV line with at least a 2D fix.
fn parse_tpv(line: &str) -> Option<(f64, f64)> {
    let report: Report = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    Some((report.lat?, report.lon?))
}

impl GpsdSource {
    pub fn new(addr: &str, timeout: Duration, min_fixes: usize) -> Self {
        Self {
            addr: addr.to_string(),
            timeout,
            min_fixes: min_fixes.max(1),
        }
    }

    fn read_fixes(&self) -> io::Result<Vec<(f64, f64)>> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "gpsd address did not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(READ_SLICE))?;
        (&stream).write_all(WATCH.as_bytes())?;

        let deadline = Instant::now() + self.timeout;
        let mut reader = BufReader::new(&stream);
        let mut fixes = Vec::new();
        let mut line = String::new();
        while fixes.len() < self.min_fixes && Instant::now() < deadline {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(fix) = parse_tpv(line.trim()) {
                        fixes.push(fix);
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(fixes)
    }
}

impl PositionSource for GpsdSource {
    fn fix(&self) -> Position {
        let fixes = match self.read_fixes() {
            Ok(fixes) => fixes,
            Err(e) => {
                warn!(addr = %self.addr, "gpsd unavailable: {}", e);
                return Position::default();
            }
        };
        if fixes.is_empty() {
            debug!("no GPS fix within {:?}", self.timeout);
            return Position::default();
        }

        let n = fixes.len() as f64;
        let (lat, lon) = fixes
            .iter()
            .fold((0.0, 0.0), |(la, lo), (lat, lon)| (la + lat, lo + lon));
        Position {
            lat: format!("{:.6}", lat / n),
            lon: format!("{:.6}", lon / n),
        }
    }
}
