/*!
Helpers to build and parse modem lines in tests

Mirrors what the Reyax modem prints for a received frame and what the
transport writes for an outbound one, checksums included.
*/

use bue_ota::{crc, frame};

pub const DEFAULT_RSSI: i32 = -80;
pub const DEFAULT_SNR: i32 = 10;

/// An outbound frame recovered from an `AT+SEND` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub dest: u16,
    pub payload: String,
}

impl SentFrame {
    /// Message tag (text before the first `:`)
    pub fn kind(&self) -> &str {
        self.payload.split(':').next().unwrap_or_default()
    }

    pub fn body(&self) -> Option<&str> {
        self.payload.split_once(':').map(|(_, body)| body)
    }
}

pub struct FrameBuilder;

impl FrameBuilder {
    /// `+RCV` line with a valid checksum
    pub fn rcv(source_id: u16, payload: &str) -> String {
        Self::rcv_with_signal(source_id, payload, DEFAULT_RSSI, DEFAULT_SNR)
    }

    pub fn rcv_with_signal(source_id: u16, payload: &str, rssi: i32, snr: i32) -> String {
        let data = format!("{payload}{}", crc::checksum(payload));
        format!("{}{source_id},{},{data},{rssi},{snr}", frame::RCV_PREFIX, data.len())
    }

    /// `+RCV` line whose checksum field is corrupted
    pub fn rcv_corrupted(source_id: u16, payload: &str) -> String {
        let crc = crc::checksum(payload);
        let flipped: String = crc
            .chars()
            .map(|c| if c == 'f' { '0' } else { 'f' })
            .collect();
        let data = format!("{payload}{flipped}");
        format!("{}{source_id},{},{data},{DEFAULT_RSSI},{DEFAULT_SNR}", frame::RCV_PREFIX, data.len())
    }

    /// The exact line the transport writes for `payload`
    pub fn at_send(dest: u16, payload: &str) -> String {
        frame::encode(dest, payload)
    }

    /// Parses an `AT+SEND` line and checks its checksum
    pub fn parse_at_send(line: &str) -> Option<SentFrame> {
        let rest = line.trim_end().strip_prefix(frame::SEND_PREFIX)?;
        let mut parts = rest.splitn(3, ',');
        let dest = parts.next()?.parse::<u16>().ok()?;
        let _len = parts.next()?;
        let payload = crc::verify(parts.next()?)?;
        Some(SentFrame {
            dest,
            payload: payload.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_send_round_trip() {
        let line = FrameBuilder::at_send(10, "TEST:helloworld,1745004290,-a 1");
        let frame = FrameBuilder::parse_at_send(&line).unwrap();
        assert_eq!(frame.dest, 10);
        assert_eq!(frame.kind(), "TEST");
        assert_eq!(frame.body(), Some("helloworld,1745004290,-a 1"));
    }

    #[test]
    fn test_corrupted_frame_fails_decode() {
        let line = FrameBuilder::rcv_corrupted(10, "ACK");
        assert!(bue_ota::frame::decode(&line).is_err());
        assert!(bue_ota::frame::decode(&FrameBuilder::rcv(10, "ACK")).is_ok());
    }
}
