//! Wire framing for the modem's AT interface.
//!
//! Outbound: `AT+SEND=<dest>,<n>,<payload><crc>\r\n` with `n = len(payload) + 2`.
//! Inbound:  `+RCV=<src>,<n>,<payload><crc>,<rssi>,<snr>`.
//!
//! The payload itself may contain commas, so the data field is rebuilt from
//! every token between the length field and the trailing rssi/snr pair.

use crate::crc;
use crate::message::Message;
use tracing::debug;

pub const SEND_PREFIX: &str = "AT+SEND=";
pub const RCV_PREFIX: &str = "+RCV=";

/// Reasons a received line never becomes a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("not a +RCV frame: {0}")]
    NotReceive(String),
    #[error("frame has {0} fields, expected at least 5")]
    TooFewFields(usize),
    #[error("invalid source address: {0}")]
    BadAddress(String),
    #[error("invalid length field: {0}")]
    BadLength(String),
    #[error("checksum mismatch")]
    Checksum,
}

/// Encodes one outbound AT command line for `dest`.
pub fn encode(dest: u16, payload: &str) -> String {
    let crc = crc::checksum(payload);
    format!("{SEND_PREFIX}{dest},{},{payload}{crc}\r\n", payload.len() + crc.len())
}

/// Decodes one `+RCV` line into a validated message.
pub fn decode(line: &str) -> Result<Message, FrameError> {
    let line = line.trim();
    let rest = line
        .strip_prefix(RCV_PREFIX)
        .ok_or_else(|| FrameError::NotReceive(line.to_string()))?;

    let fields: Vec<&str> = rest.split(',').collect();
    if fields.len() < 5 {
        return Err(FrameError::TooFewFields(fields.len()));
    }

    let source_id = fields[0]
        .trim()
        .parse::<u16>()
        .map_err(|_| FrameError::BadAddress(fields[0].to_string()))?;
    let declared = fields[1]
        .trim()
        .parse::<usize>()
        .map_err(|_| FrameError::BadLength(fields[1].to_string()))?;

    let data = fields[2..fields.len() - 2].join(",");
    if declared != data.len() {
        debug!(source_id, declared, actual = data.len(), "length field disagrees with frame data");
    }

    let payload = crc::verify(&data).ok_or(FrameError::Checksum)?;
    Ok(Message::from_payload(source_id, payload))
}
