//! Serial link implementation.
//!
//! Owns the serial device plus a background reader task that appends every
//! received byte to the shared receive buffer. Reads use a short poll
//! timeout so the task notices the stop signal quickly; on an unexpected
//! I/O error (typically the USB adapter disappearing and coming back) the
//! task closes and reopens the device and keeps going.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Link, SharedRxBuffer};
use crate::config::{Parity, SerialConfig, StopBits};
use crate::error::{LinkError, Result};

/// Serial link to the controller.
#[derive(Debug)]
pub struct SerialLink {
    config: SerialConfig,
    conn: Arc<Mutex<Option<SerialStream>>>,
    rx: Arc<SharedRxBuffer>,
    restarts: Arc<AtomicU64>,
    stop: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(config: SerialConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(None)),
            rx: Arc::new(SharedRxBuffer::new()),
            restarts: Arc::new(AtomicU64::new(0)),
            stop: CancellationToken::new(),
            reader: None,
        })
    }

    fn open_port(config: &SerialConfig) -> Result<SerialStream> {
        let data_bits = match config.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match config.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::OnePointFive => {
                // The driver cannot express 1.5 stop bits
                warn!("[Serial Link] 1.5 stop bits unavailable, using 2");
                tokio_serial::StopBits::Two
            }
        };

        let mut port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(config.read_timeout)
            .open_native_async()
            .map_err(|e| {
                LinkError::ConnectionFailed(format!(
                    "Failed to open serial port {}: {e}",
                    config.port
                ))
            })?;

        #[cfg(unix)]
        port.set_exclusive(false)
            .map_err(|e| LinkError::IoError(format!("Failed to set exclusive mode: {e}")))?;

        Ok(port)
    }

    fn spawn_reader(&mut self) {
        let config = self.config.clone();
        let conn = self.conn.clone();
        let rx = self.rx.clone();
        let restarts = self.restarts.clone();
        let stop = self.stop.clone();

        self.reader = Some(tokio::spawn(async move {
            let mut chunk = [0u8; 256];
            loop {
                if stop.is_cancelled() {
                    return;
                }

                let read = {
                    let mut guard = conn.lock().await;
                    match guard.as_mut() {
                        Some(port) => {
                            match timeout(config.read_timeout, port.read(&mut chunk)).await {
                                Ok(Ok(n)) => Ok(Some(n)),
                                Ok(Err(e)) => Err(e),
                                // Poll window elapsed with nothing to read
                                Err(_) => Ok(None),
                            }
                        }
                        None => Ok(None),
                    }
                };

                match read {
                    Ok(Some(n)) if n > 0 => rx.extend(&chunk[..n]),
                    Ok(_) => {
                        // Nothing received; give writers a chance at the lock
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        // Usually "device reports readiness to read but
                        // returned no data" when the adapter drops off the
                        // bus; reopening the device recovers it.
                        error!(
                            "[Serial Link] Resetting {} after read error: {e}",
                            config.port
                        );
                        restarts.fetch_add(1, Ordering::Relaxed);
                        let mut guard = conn.lock().await;
                        *guard = None;
                        match Self::open_port(&config) {
                            Ok(port) => *guard = Some(port),
                            Err(e) => {
                                error!("[Serial Link] Reopen failed: {e}");
                                drop(guard);
                                tokio::select! {
                                    _ = stop.cancelled() => return,
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                }
                            }
                        }
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl Link for SerialLink {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn rx(&self) -> &Arc<SharedRxBuffer> {
        &self.rx
    }

    async fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let port = Self::open_port(&self.config)?;
        *self.conn.lock().await = Some(port);
        self.flush().await;
        self.spawn_reader();
        info!("[Serial Link] Opened {}", self.config.port);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;

        let send = async {
            port.write_all(data).await?;
            port.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match timeout(self.config.write_timeout, send).await {
            Ok(Ok(())) => {
                debug!(
                    hex_data = %hex::encode(data),
                    length = data.len(),
                    direction = "send",
                    "[Serial Link] Raw packet"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(LinkError::SendFailed(format!("Failed to send data: {e}"))),
            Err(_) => Err(LinkError::Timeout(format!(
                "Send timed out after {:?}",
                self.config.write_timeout
            ))),
        }
    }

    async fn flush(&self) {
        let guard = self.conn.lock().await;
        if let Some(port) = guard.as_ref() {
            if let Err(e) = port.clear(ClearBuffer::All) {
                warn!("[Serial Link] Failed to clear device buffers: {e}");
            }
        }
        drop(guard);
        self.rx.clear();
    }

    async fn close(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.reader.take() {
            let _ = handle.await;
        }
        self.conn.lock().await.take();
        info!("[Serial Link] Closed {}", self.config.port);
    }

    fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_link_creation() {
        let link = SerialLink::new(SerialConfig::default()).unwrap();
        assert_eq!(link.kind(), "serial");
        assert_eq!(link.restarts(), 0);
        assert!(link.rx().is_empty());
    }

    #[test]
    fn test_serial_link_rejects_bad_config() {
        let config = SerialConfig {
            baud_rate: 0,
            ..Default::default()
        };
        assert!(SerialLink::new(config).is_err());
    }
}
