//! Mock link for protocol tests.
//!
//! Records every frame the engine writes and feeds scripted replies into
//! the shared receive buffer, so full transactions run without a device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Link, SharedRxBuffer};
use crate::error::Result;

/// Scripted link for testing protocol logic.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// the boxed link.
#[derive(Debug, Default, Clone)]
pub struct MockLink {
    rx: Arc<SharedRxBuffer>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    flushes: Arc<AtomicU64>,
    restarts: Arc<AtomicU64>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply that lands in the receive buffer after the next write.
    pub fn push_reply(&self, frame: Vec<u8>) {
        self.replies.lock().push_back(frame);
    }

    /// Place bytes directly into the receive buffer, bypassing the
    /// write/reply pairing.
    pub fn inject(&self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Every frame written so far, oldest first.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Simulate a reader restart, for stats tests.
    pub fn bump_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Link for MockLink {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn rx(&self) -> &Arc<SharedRxBuffer> {
        &self.rx
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.sent.lock().push(data.to_vec());
        if let Some(reply) = self.replies.lock().pop_front() {
            self.rx.extend(&reply);
        }
        Ok(())
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.rx.clear();
    }

    async fn close(&mut self) {}

    fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_link_write_delivers_reply() {
        let link = MockLink::new();
        link.push_reply(vec![0x9d, 0x03]);
        link.write(&[0x01, 0x02]).await.unwrap();
        assert_eq!(link.sent_frames(), vec![vec![0x01, 0x02]]);
        assert_eq!(link.rx().peek(2), vec![0x9d, 0x03]);
    }

    #[tokio::test]
    async fn test_mock_link_flush_clears_buffer() {
        let link = MockLink::new();
        link.inject(&[0x01]);
        link.flush().await;
        assert!(link.rx().is_empty());
        assert_eq!(link.flush_count(), 1);
    }
}
