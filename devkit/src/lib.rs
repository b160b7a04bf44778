/*!
# bUE DevKit - Stubs and helpers for testing without a radio

Library used by the base station and node test suites:
- In-memory serial channel standing in for the Reyax modem
- Builders for `+RCV` / `AT+SEND` lines with valid checksums
- Harness wiring an `Ota` handle and its pump to the mock channel
*/

pub mod mock_channel;
pub mod frame_builder;
pub mod test_utils;

pub use mock_channel::MockChannel;
pub use frame_builder::{FrameBuilder, SentFrame};
pub use test_utils::TestHarness;
