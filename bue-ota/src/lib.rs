//! bUE over-the-air transport
//!
//! Turns a line-oriented serial channel to a Reyax-style LoRa modem into a
//! queue of validated, address-tagged application messages:
//! - CRC-8 integrity check appended to every payload
//! - `AT+SEND` encoding and `+RCV` decoding (payloads may contain commas)
//! - Bounded outbound/inbound queues drained by a dedicated transport thread
//! - Shared shutdown flag checked by every long-lived loop

pub mod channel;
pub mod crc;
pub mod frame;
pub mod message;
pub mod shutdown;
pub mod transport;

pub use channel::{Channel, ChannelError, SerialChannel};
pub use frame::FrameError;
pub use message::{Message, MessageType};
pub use shutdown::Shutdown;
pub use transport::{Ota, TransportPump, BROADCAST_ID};
