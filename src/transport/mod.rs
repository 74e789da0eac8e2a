//! Transport layer.
//!
//! This module separates the physical link from protocol logic. Each link
//! owns a background reader task that appends every received byte to a
//! shared receive buffer; the frame codec drains that buffer from the
//! caller's side. Supported links:
//!
//! - **Serial** - direct RS232/RS485 connection to the controller
//! - **TCP** - serial-over-TCP bridge (e.g. a network serial server)
//! - **Mock** - scripted link for protocol tests

pub mod mock;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;

pub use mock::MockLink;
pub use serial::SerialLink;
pub use tcp::TcpLink;

/// Receive buffer shared between a link's reader task and the frame codec.
///
/// The reader side only appends; the parser side only drains. The mutex is
/// held for single append or drain operations, never across a parse.
#[derive(Debug, Default)]
pub struct SharedRxBuffer {
    buf: Mutex<BytesMut>,
    data_ready: Notify,
    discarded_bytes: AtomicU64,
}

impl SharedRxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and wake any waiting transaction.
    pub fn extend(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buf.lock().extend_from_slice(bytes);
        self.data_ready.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Copy of the first `n` buffered bytes (fewer if less is available).
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let buf = self.buf.lock();
        buf[..n.min(buf.len())].to_vec()
    }

    /// Remove and return the first `n` buffered bytes.
    ///
    /// Callers must have checked `len()` first; `n` is clamped to the
    /// buffered length.
    pub fn pop(&self, n: usize) -> Vec<u8> {
        let mut buf = self.buf.lock();
        let n = n.min(buf.len());
        buf.split_to(n).to_vec()
    }

    /// Drop exactly one leading byte, counting it as discarded.
    ///
    /// Used by the frame codec to resynchronize when the leading byte
    /// cannot start a valid frame.
    pub fn discard_byte(&self) -> Option<u8> {
        let mut buf = self.buf.lock();
        if buf.is_empty() {
            return None;
        }
        let byte = buf[0];
        buf.advance(1);
        self.discarded_bytes.fetch_add(1, Ordering::Relaxed);
        Some(byte)
    }

    /// Discard everything currently buffered.
    pub fn clear(&self) {
        self.buf.lock().clear();
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes.load(Ordering::Relaxed)
    }

    /// Wait until new data arrives or `window` elapses, whichever is first.
    pub async fn wait_for_data(&self, window: Duration) {
        let _ = tokio::time::timeout(window, self.data_ready.notified()).await;
    }

    /// Current buffer contents rendered as a string, for diagnostics.
    pub fn as_string(&self) -> String {
        let buf = self.buf.lock();
        buf.iter().map(|&b| b as char).collect()
    }
}

/// A physical or logical link to the controller.
///
/// Implementations own the underlying device plus a background reader task
/// feeding [`SharedRxBuffer`]; the engine treats them uniformly through
/// this trait.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    /// Link type identifier ("serial", "tcp", "mock").
    fn kind(&self) -> &'static str;

    /// The receive buffer filled by this link's reader task.
    fn rx(&self) -> &Arc<SharedRxBuffer>;

    /// Open the underlying device and start the reader task.
    async fn open(&mut self) -> Result<()>;

    /// Write a complete frame to the device.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Discard device input/output queues and the shared receive buffer.
    async fn flush(&self);

    /// Stop the reader task and close the device.
    async fn close(&mut self);

    /// Reader task restarts after I/O errors.
    fn restarts(&self) -> u64;

    /// Extra per-transaction timeout margin this link requires.
    fn timeout_padding(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_buffer_append_and_drain() {
        let rx = SharedRxBuffer::new();
        assert!(rx.is_empty());
        rx.extend(&[0x01, 0x02, 0x03]);
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.peek(2), vec![0x01, 0x02]);
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.pop(2), vec![0x01, 0x02]);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_rx_buffer_discard_byte() {
        let rx = SharedRxBuffer::new();
        assert_eq!(rx.discard_byte(), None);
        assert_eq!(rx.discarded_bytes(), 0);
        rx.extend(&[0xaa, 0xbb]);
        assert_eq!(rx.discard_byte(), Some(0xaa));
        assert_eq!(rx.discarded_bytes(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_rx_buffer_clear_keeps_discard_count() {
        let rx = SharedRxBuffer::new();
        rx.extend(&[0x01, 0x02]);
        rx.discard_byte();
        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(rx.discarded_bytes(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_data_wakes_on_extend() {
        let rx = Arc::new(SharedRxBuffer::new());
        let waiter = rx.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_data(Duration::from_secs(5)).await;
        });
        tokio::task::yield_now().await;
        rx.extend(&[0x01]);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }
}
