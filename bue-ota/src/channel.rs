//! Byte channel to the radio modem.
//!
//! The transport only needs line-oriented writes and reads that give up after
//! a short timeout, so any backend (real serial port, in-memory mock) fits
//! behind [`Channel`].

use crate::shutdown::Shutdown;
use serialport::SerialPort;
use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;
use tracing::{error, info};

/// Read timeout on the serial port; bounds how long one transport tick blocks.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Delay between attempts to open the serial port at startup.
pub const OPEN_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed")]
    Closed,
}

pub trait Channel: Send {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;

    /// Next complete line without its terminator, or `None` if nothing
    /// complete arrived within the read timeout.
    fn read_line(&mut self) -> Result<Option<String>, ChannelError>;
}

/// Modem attached to a serial device such as `/dev/ttyUSB0`.
pub struct SerialChannel {
    port_name: String,
    reader: BufReader<Box<dyn SerialPort>>,
    writer: Box<dyn SerialPort>,
    partial: Vec<u8>,
}

impl SerialChannel {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, ChannelError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let writer = port.try_clone()?;
        Ok(Self {
            port_name: port_name.to_string(),
            reader: BufReader::new(port),
            writer,
            partial: Vec::new(),
        })
    }

    /// Keeps trying to open the port until it succeeds. Returns `None` only
    /// when shutdown is requested first.
    pub fn open_with_retry(port_name: &str, baud_rate: u32, shutdown: &Shutdown) -> Option<Self> {
        loop {
            match Self::open(port_name, baud_rate) {
                Ok(channel) => {
                    info!(port = port_name, baud_rate, "serial channel opened");
                    return Some(channel);
                }
                Err(e) => error!(port = port_name, "failed to open serial channel: {}", e),
            }
            if shutdown.sleep(OPEN_RETRY_BACKOFF) {
                return None;
            }
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Channel for SerialChannel {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, ChannelError> {
        // Bytes read before a timeout stay in `partial` for the next call.
        match self.reader.read_until(b'\n', &mut self.partial) {
            Ok(0) => Ok(None),
            Ok(_) if self.partial.ends_with(b"\n") => {
                let raw = std::mem::take(&mut self.partial);
                Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
