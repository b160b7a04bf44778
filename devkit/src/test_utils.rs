/*!
Test harness for bUE state machines

Wires an `Ota` handle to a `MockChannel` and drives the transport pump by hand,
so tests control exactly when frames cross the "air".
*/

use crate::frame_builder::{FrameBuilder, SentFrame};
use crate::mock_channel::MockChannel;
use anyhow::Result;
use bue_ota::{Message, Ota, TransportPump};

/// Upper bound on pump ticks per drive call
const MAX_TICKS: usize = 10_000;

pub struct TestHarness {
    pub channel: MockChannel,
    pub ota: Ota,
    pump: TransportPump,
}

impl TestHarness {
    /// Harness for a device with radio address `id`
    pub fn new(id: u16) -> Self {
        env_logger::try_init().ok();

        let channel = MockChannel::new();
        let (ota, pump) = Ota::new(id, Box::new(channel.clone()));
        Self { channel, ota, pump }
    }

    /// Injects a well-formed `+RCV` frame from `source_id`
    pub fn inject(&self, source_id: u16, payload: &str) {
        self.channel.simulate_incoming(FrameBuilder::rcv(source_id, payload));
    }

    /// Ticks the pump until every injected line is read and the outbound
    /// queue is empty
    pub fn pump_all(&mut self) {
        for _ in 0..MAX_TICKS {
            if !self.pump.tick() && self.channel.pending_incoming() == 0 {
                return;
            }
        }
        log::warn!("pump_all: still busy after {} ticks", MAX_TICKS);
    }

    /// Pumps, then drains the handle's inbound queue
    pub fn deliver(&mut self) -> Vec<Message> {
        self.pump_all();
        self.ota.get_new_messages()
    }

    /// Pumps, then returns every frame written so far
    pub fn flush(&mut self) -> Vec<SentFrame> {
        self.pump_all();
        self.channel.sent_frames()
    }

    /// Frames already written, without pumping
    pub fn sent(&self) -> Vec<SentFrame> {
        self.channel.sent_frames()
    }

    /// Fails unless a frame with exactly `payload` was sent to `dest`
    pub fn assert_sent(&mut self, dest: u16, payload: &str) -> Result<()> {
        let sent = self.flush();
        if sent.iter().any(|f| f.dest == dest && f.payload == payload) {
            Ok(())
        } else {
            anyhow::bail!("expected {:?} to {}, sent: {:?}", payload, dest, sent)
        }
    }

    /// Flushes anything still queued in the handle, then forgets all traffic
    pub fn clear(&mut self) {
        self.pump_all();
        self.channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bue_ota::MessageType;

    #[test]
    fn test_harness_delivers_injected_frames() {
        let mut harness = TestHarness::new(1);
        harness.inject(10, "REQ:bue-10,10");
        harness.channel.simulate_incoming("OK");
        harness.inject(11, "ACK");

        let messages = harness.deliver();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageType::Req);
        assert_eq!(messages[0].body(), "bue-10,10");
        assert_eq!(messages[1].source_id, 11);
    }

    #[test]
    fn test_harness_records_outbound() {
        let mut harness = TestHarness::new(1);
        harness.ota.send(10, MessageType::Con, Some("1"));
        assert!(harness.assert_sent(10, "CON:1").is_ok());
        assert!(harness.assert_sent(10, "PINGR").is_err());

        harness.clear();
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn test_clear_discards_queued_frames() {
        let mut harness = TestHarness::new(1);
        harness.ota.send(10, MessageType::Con, Some("1"));
        harness.clear();
        assert!(harness.flush().is_empty());
    }

    #[test]
    fn test_failed_writes_are_dropped() {
        let mut harness = TestHarness::new(1);
        harness.channel.set_fail_writes(true);
        harness.ota.send(10, MessageType::Ack, None);
        assert!(harness.flush().is_empty());
    }
}
