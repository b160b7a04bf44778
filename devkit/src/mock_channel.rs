/*!
Mock serial channel for development without a modem

Records every line the transport writes and lets tests inject lines as if the
modem had received them over the air.
*/

use bue_ota::{Channel, ChannelError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame_builder::{FrameBuilder, SentFrame};

/// Mock channel that behaves like the serial link to the modem
#[derive(Clone, Default)]
pub struct MockChannel {
    written: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<VecDeque<String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a raw line to be returned by the next `read_line`
    pub fn simulate_incoming<S: Into<String>>(&self, line: S) {
        let line = line.into();
        log::debug!("[MOCK] incoming: {}", line);
        self.incoming.lock().push_back(line);
    }

    /// Number of injected lines the transport has not read yet
    pub fn pending_incoming(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Every raw line written so far (including `\r\n`)
    pub fn written_lines(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Written lines decoded back into destination + payload
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.written
            .lock()
            .iter()
            .filter_map(|line| FrameBuilder::parse_at_send(line))
            .collect()
    }

    /// Makes subsequent writes fail as if the port had gone away
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.written.lock().clear();
        self.incoming.lock().clear();
    }
}

impl Channel for MockChannel {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        log::debug!("[MOCK] written: {}", line.trim_end());
        self.written.lock().push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, ChannelError> {
        Ok(self.incoming.lock().pop_front())
    }
}
