//! TCP link implementation, for serial-over-network bridges.
//!
//! Maintains a client socket to the configured host:port. The reader task
//! reconnects with a backoff after connection loss, so transient network
//! failures cost transactions but never the process. Network jitter makes
//! round trips slower than a directly attached serial line, so this link
//! asks for a larger per-transaction timeout margin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Link, SharedRxBuffer};
use crate::config::TcpConfig;
use crate::error::{LinkError, Result};

/// Extra timeout margin to absorb network jitter.
const TCP_TIMEOUT_PADDING: Duration = Duration::from_millis(2000);

/// Poll window for socket reads, short enough to observe the stop signal.
const READ_POLL: Duration = Duration::from_millis(50);

/// TCP link to a serial bridge in front of the controller.
#[derive(Debug)]
pub struct TcpLink {
    config: TcpConfig,
    conn: Arc<Mutex<Option<TcpStream>>>,
    rx: Arc<SharedRxBuffer>,
    restarts: Arc<AtomicU64>,
    stop: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl TcpLink {
    pub fn new(config: TcpConfig) -> Result<Self> {
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

    async fn connect(config: &TcpConfig) -> Result<TcpStream> {
        let addr = format!("{}:{}", config.host, config.port);
        match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("[TCP Link] Connected to {addr}");
                Ok(stream)
            }
            Ok(Err(e)) => Err(LinkError::ConnectionFailed(format!(
                "Failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(LinkError::Timeout(format!("Connection to {addr} timed out"))),
        }
    }

    fn spawn_reader(&mut self) {
        let config = self.config.clone();
        let conn = self.conn.clone();
        let rx = self.rx.clone();
        let restarts = self.restarts.clone();
        let stop = self.stop.clone();

        self.reader = Some(tokio::spawn(async move {
            let mut chunk = [0u8; 2048];
            loop {
                if stop.is_cancelled() {
                    return;
                }

                // Reconnect if the socket was dropped by an earlier failure
                {
                    let mut guard = conn.lock().await;
                    if guard.is_none() {
                        restarts.fetch_add(1, Ordering::Relaxed);
                        match Self::connect(&config).await {
                            Ok(stream) => {
                                rx.clear();
                                *guard = Some(stream);
                            }
                            Err(e) => {
                                error!("[TCP Link] Reconnect failed: {e}");
                                drop(guard);
                                tokio::select! {
                                    _ = stop.cancelled() => return,
                                    _ = tokio::time::sleep(config.reconnect_backoff) => {}
                                }
                                continue;
                            }
                        }
                    }
                }

                let read = {
                    let mut guard = conn.lock().await;
                    match guard.as_mut() {
                        Some(stream) => match timeout(READ_POLL, stream.read(&mut chunk)).await {
                            Ok(Ok(0)) => {
                                warn!("[TCP Link] Connection closed by peer");
                                *guard = None;
                                Ok(None)
                            }
                            Ok(Ok(n)) => Ok(Some(n)),
                            Ok(Err(e)) => {
                                *guard = None;
                                Err(e)
                            }
                            Err(_) => Ok(None),
                        },
                        None => Ok(None),
                    }
                };

                match read {
                    Ok(Some(n)) => rx.extend(&chunk[..n]),
                    Ok(None) => {
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        error!("[TCP Link] Read error, resetting connection: {e}");
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl Link for TcpLink {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn rx(&self) -> &Arc<SharedRxBuffer> {
        &self.rx
    }

    async fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let stream = Self::connect(&self.config).await?;
        *self.conn.lock().await = Some(stream);
        self.rx.clear();
        self.spawn_reader();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().ok_or(LinkError::NotConnected)?;
        match stream.write_all(data).await {
            Ok(()) => {
                debug!(
                    hex_data = %hex::encode(data),
                    length = data.len(),
                    direction = "send",
                    "[TCP Link] Raw packet"
                );
                Ok(())
            }
            Err(e) => {
                // Drop the socket; the reader task reconnects
                *guard = None;
                Err(LinkError::SendFailed(format!("Failed to send data: {e}")))
            }
        }
    }

    async fn flush(&self) {
        self.rx.clear();
    }

    async fn close(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.reader.take() {
            let _ = handle.await;
        }
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        info!(
            "[TCP Link] Disconnected from {}:{}",
            self.config.host, self.config.port
        );
    }

    fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn timeout_padding(&self) -> Duration {
        TCP_TIMEOUT_PADDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_link_creation() {
        let link = TcpLink::new(TcpConfig::default()).unwrap();
        assert_eq!(link.kind(), "tcp");
        assert_eq!(link.timeout_padding(), Duration::from_millis(2000));
    }

    #[test]
    fn test_tcp_link_rejects_bad_config() {
        let config = TcpConfig {
            port: 0,
            ..Default::default()
        };
        assert!(TcpLink::new(config).is_err());
    }

    #[tokio::test]
    async fn test_tcp_link_round_trip_against_listener() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server that replies with a fixed frame after any request
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            socket.write_all(&[0x9d, 0x03, 0x02]).await.unwrap();
        });

        let config = TcpConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        };
        let mut link = TcpLink::new(config).unwrap();
        link.open().await.unwrap();
        link.write(&[0x9d, 0x03, 0x00, 0x07, 0x00, 0x01, 0x00, 0x00])
            .await
            .unwrap();

        // The reader task should land the reply in the shared buffer
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while link.rx().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(link.rx().peek(3), vec![0x9d, 0x03, 0x02]);
        link.close().await;
    }
}
