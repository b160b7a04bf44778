//! Framed transport: queues between application code and the serial channel.
//!
//! [`Ota`] is the cheap, cloneable handle state machines use to enqueue
//! outbound messages and drain validated inbound ones. [`TransportPump`] owns
//! the channel exclusively and runs on its own thread; each tick it reads at
//! most one line into the inbound queue, then flushes the whole outbound queue.

use crate::channel::Channel;
use crate::frame;
use crate::message::{self, Message, MessageType};
use crate::shutdown::Shutdown;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};

/// Radio address every node listens on.
pub const BROADCAST_ID: u16 = 0;
pub const OUTBOUND_CAPACITY: usize = 256;
pub const INBOUND_CAPACITY: usize = 256;

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct OutboundFrame {
    dest: u16,
    payload: String,
}

#[derive(Clone)]
pub struct Ota {
    id: u16,
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl Ota {
    /// Wires a handle and its pump around `channel`.
    pub fn new(id: u16, channel: Box<dyn Channel>) -> (Self, TransportPump) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let ota = Self {
            id,
            outbound: outbound_tx,
            inbound: Arc::new(Mutex::new(inbound_rx)),
        };
        let pump = TransportPump {
            channel,
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        (ota, pump)
    }

    /// Local radio address.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Queues a message for `dest`. Never blocks; a full queue drops the
    /// message, retries belong to the protocol layer.
    pub fn send(&self, dest: u16, kind: MessageType, body: Option<&str>) {
        let payload = message::payload(&kind, body);
        trace!(dest, %payload, "queueing outbound message");
        match self.outbound.try_send(OutboundFrame { dest, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!(dest, payload = %frame.payload, "outbound queue full, dropping message")
            }
            Err(TrySendError::Closed(frame)) => {
                debug!(dest, payload = %frame.payload, "transport stopped, dropping message")
            }
        }
    }

    /// Drains every message received since the last call, in arrival order.
    pub fn get_new_messages(&self) -> Vec<Message> {
        let mut inbound = self.inbound.lock();
        let mut messages = Vec::new();
        while let Ok(msg) = inbound.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

pub struct TransportPump {
    channel: Box<dyn Channel>,
    outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<Message>,
}

impl TransportPump {
    /// One transport step. Returns `true` if a line was read or anything
    /// was written.
    pub fn tick(&mut self) -> bool {
        let received = self.receive_one();
        let flushed = self.flush();
        received || flushed > 0
    }

    fn receive_one(&mut self) -> bool {
        let line = match self.channel.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return false,
            Err(e) => {
                warn!("channel read failed: {}", e);
                return false;
            }
        };

        let line = line.trim();
        if line.is_empty() || line == "OK" {
            return true;
        }

        match frame::decode(line) {
            Ok(msg) => {
                debug!(source_id = msg.source_id, kind = %msg.kind, "received message");
                if let Err(TrySendError::Full(msg)) = self.inbound.try_send(msg) {
                    warn!(source_id = msg.source_id, "inbound queue full, dropping message");
                }
            }
            Err(e) => debug!(%line, "dropping frame: {}", e),
        }
        true
    }

    fn flush(&mut self) -> usize {
        let mut written = 0;
        while let Ok(frame) = self.outbound.try_recv() {
            let line = frame::encode(frame.dest, &frame.payload);
            match self.channel.write_line(&line) {
                Ok(()) => written += 1,
                Err(e) => error!(dest = frame.dest, payload = %frame.payload, "channel write failed, message dropped: {}", e),
            }
        }
        written
    }

    /// Pumps until shutdown, then flushes whatever is still queued.
    pub fn run(mut self, shutdown: Shutdown) {
        while !shutdown.is_triggered() {
            if !self.tick() {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
        self.flush();
        debug!("transport pump stopped");
    }

    pub fn spawn(self, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("ota-transport".into())
            .spawn(move || self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::crc;
    use std::collections::VecDeque;

    #[derive(Clone, Default)]
    struct ScriptedChannel {
        incoming: Arc<Mutex<VecDeque<String>>>,
        written: Arc<Mutex<Vec<String>>>,
        broken: bool,
    }

    impl Channel for ScriptedChannel {
        fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
            if self.broken {
                return Err(ChannelError::Closed);
            }
            self.written.lock().push(line.to_string());
            Ok(())
        }

        fn read_line(&mut self) -> Result<Option<String>, ChannelError> {
            Ok(self.incoming.lock().pop_front())
        }
    }

    fn rcv(src: u16, payload: &str) -> String {
        let data = format!("{payload}{}", crc::checksum(payload));
        format!("+RCV={src},{},{data},-80,10", data.len())
    }

    #[test]
    fn test_outbound_order_is_global_fifo() {
        let channel = ScriptedChannel::default();
        let (ota, mut pump) = Ota::new(1, Box::new(channel.clone()));

        ota.send(10, MessageType::Pingr, None);
        ota.send(20, MessageType::Con, Some("1"));
        ota.send(10, MessageType::Canc, None);
        pump.tick();

        let written = channel.written.lock().clone();
        assert_eq!(written.len(), 3);
        assert!(written[0].starts_with("AT+SEND=10,7,PINGR"));
        assert!(written[1].starts_with("AT+SEND=20,7,CON:1"));
        assert!(written[2].starts_with("AT+SEND=10,6,CANC"));
    }

    #[test]
    fn test_one_inbound_line_per_tick() {
        let channel = ScriptedChannel::default();
        channel.incoming.lock().extend([rcv(10, "ACK"), rcv(20, "ACK")]);
        let (ota, mut pump) = Ota::new(1, Box::new(channel.clone()));

        pump.tick();
        let first = ota.get_new_messages();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source_id, 10);

        pump.tick();
        let second = ota.get_new_messages();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_id, 20);
        assert!(ota.get_new_messages().is_empty());
    }

    #[test]
    fn test_modem_noise_and_bad_frames_are_dropped() {
        let channel = ScriptedChannel::default();
        channel.incoming.lock().extend([
            "OK".to_string(),
            String::new(),
            "+RCV=1,5,HELLO".to_string(),
            "+RCV=1,3,ACK,-80,10".to_string(),
            rcv(1, "PINGR"),
        ]);
        let (ota, mut pump) = Ota::new(10, Box::new(channel));

        for _ in 0..5 {
            pump.tick();
        }
        let messages = ota.get_new_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageType::Pingr);
    }

    #[test]
    fn test_write_failure_drops_without_panicking() {
        let channel = ScriptedChannel {
            broken: true,
            ..Default::default()
        };
        let (ota, mut pump) = Ota::new(10, Box::new(channel.clone()));
        ota.send(1, MessageType::Ping, Some("IDLE,,"));
        assert!(!pump.tick());
        assert!(channel.written.lock().is_empty());
    }

    #[test]
    fn test_pump_thread_stops_on_shutdown() {
        let channel = ScriptedChannel::default();
        let (ota, pump) = Ota::new(10, Box::new(channel.clone()));
        let shutdown = Shutdown::new();
        let handle = pump.spawn(shutdown.clone()).unwrap();

        ota.send(1, MessageType::Ack, None);
        shutdown.trigger();
        handle.join().unwrap();

        assert_eq!(channel.written.lock().len(), 1);
    }
}
