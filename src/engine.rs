//! Modbus master transaction engine.
//!
//! One engine owns one link and runs one transaction at a time: build the
//! request, write it, poll the receive buffer until the response frame is
//! complete or the timeout budget is spent, validate, then hand the value
//! to the register sink. Every failure class is counted and logged here
//! and surfaced to the caller as an empty result; retry policy belongs to
//! the caller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{EngineConfig, TransportConfig};
use crate::error::Result;
use crate::frame::{
    register_from_frame, FrameCodec, FrameStatus, FUNC_READ_FILE, FUNC_WRITE_REGS,
    MIN_RESPONSE_LEN, OFF_ADDRESS, OFF_FILE_PAYLOAD, OFF_FILE_PAYLOAD_LEN, OFF_FUNCTION,
    OFF_READ_DATA, OFF_RESPONSE_LEN, RESPONSE_OVERHEAD, WRITE_RESPONSE_LEN,
};
use crate::registers::RegisterSink;
use crate::stats::{CommCounters, CommStats};
use crate::transport::{Link, SerialLink, TcpLink};

/// Fixed settling margin added to the character-time estimate.
const TIMEOUT_SETTLING_MARGIN: Duration = Duration::from_millis(3000);

/// Per-transaction timeout budget: bit time at the configured baud rate,
/// times 10 bits per character, times 10 characters, times two packets,
/// plus the settling margin and any configured allowances.
pub(crate) fn compute_packet_timeout(
    baud_rate: u32,
    additional: Duration,
    padding: Duration,
) -> Duration {
    let two_packets_ms = 1000.0 / baud_rate.max(1) as f64 * 10.0 * 10.0 * 2.0;
    Duration::from_millis(two_packets_ms as u64) + TIMEOUT_SETTLING_MARGIN + additional + padding
}

/// Single-link Modbus master.
pub struct TransactionEngine {
    link: Box<dyn Link>,
    codec: FrameCodec,
    counters: Arc<CommCounters>,
    sink: Arc<dyn RegisterSink>,
    /// Serializes whole request/response cycles; the protocol has no
    /// request ids, so at most one request may be outstanding per link.
    comm_lock: tokio::sync::Mutex<()>,
    packet_timeout: Duration,
    poll_tick: Duration,
    stop: CancellationToken,
    /// Responses for this register are swallowed instead of cached
    encapsulation_register: Option<u16>,
}

impl TransactionEngine {
    /// Open the configured link and build an engine on top of it.
    pub async fn connect(config: EngineConfig, sink: Arc<dyn RegisterSink>) -> Result<Self> {
        config.validate()?;
        let mut link: Box<dyn Link> = match &config.transport {
            TransportConfig::Serial(c) => Box::new(SerialLink::new(c.clone())?),
            TransportConfig::Tcp(c) => Box::new(TcpLink::new(c.clone())?),
        };
        link.open().await?;
        Ok(Self::with_link(config, link, sink))
    }

    /// Build an engine over an already-opened link.
    pub fn with_link(
        config: EngineConfig,
        link: Box<dyn Link>,
        sink: Arc<dyn RegisterSink>,
    ) -> Self {
        let counters = Arc::new(CommCounters::new());
        let codec = FrameCodec::new(
            config.slave_address,
            config.response_address,
            config.use_input_registers,
            counters.clone(),
        );
        let packet_timeout = compute_packet_timeout(
            config.transport.baud_rate(),
            config.additional_timeout,
            link.timeout_padding(),
        );
        let poll_tick = if config.low_cpu_mode {
            Duration::from_millis(30)
        } else {
            Duration::from_millis(10)
        };
        Self {
            link,
            codec,
            counters,
            sink,
            comm_lock: tokio::sync::Mutex::new(()),
            packet_timeout,
            poll_tick,
            stop: CancellationToken::new(),
            encapsulation_register: None,
        }
    }

    /// Read `length_words` registers starting at `register` and push the
    /// value to the register sink.
    pub async fn process_read(&self, register: u16, length_words: u16) -> Option<String> {
        self.process_read_opts(register, length_words, false, false)
            .await
    }

    /// Read with cache and decoding control. `skip_cache_update` keeps
    /// diagnostic reads out of the register cache; `as_string` returns the
    /// character decode of the payload instead of hex.
    pub async fn process_read_opts(
        &self,
        register: u16,
        length_words: u16,
        skip_cache_update: bool,
        as_string: bool,
    ) -> Option<String> {
        let request = self.codec.build_read_request(register, length_words)?;
        self.run_transaction(&request, skip_cache_update, as_string, WRITE_RESPONSE_LEN)
            .await
    }

    /// Write `data` to `length_words` registers at `register`. The echo
    /// response is validated but never cached.
    pub async fn process_write(&self, register: u16, length_words: u16, data: &[u8]) -> bool {
        self.process_write_opts(register, length_words, data, None)
            .await
    }

    /// Write with an optional minimum-response-length override for
    /// exchanges whose reply is shorter than a standard echo.
    pub(crate) async fn process_write_opts(
        &self,
        register: u16,
        length_words: u16,
        data: &[u8],
        min_response_override: Option<usize>,
    ) -> bool {
        let Some(request) = self.codec.build_write_request(register, length_words, data) else {
            return false;
        };
        self.run_transaction(
            &request,
            true,
            false,
            min_response_override.unwrap_or(WRITE_RESPONSE_LEN),
        )
        .await
        .is_some()
    }

    /// Read a file record. `register` is the record number.
    pub async fn process_file_read(
        &self,
        register: u16,
        length_words: u16,
        file_num: u16,
    ) -> Option<String> {
        self.process_file_read_opts(register, length_words, file_num, false, false)
            .await
    }

    pub async fn process_file_read_opts(
        &self,
        register: u16,
        length_words: u16,
        file_num: u16,
        skip_cache_update: bool,
        as_string: bool,
    ) -> Option<String> {
        let request = self
            .codec
            .build_file_read_request(register, length_words, file_num)?;
        self.run_transaction(&request, skip_cache_update, as_string, WRITE_RESPONSE_LEN)
            .await
    }

    /// One full request/response cycle under the communication lock.
    async fn run_transaction(
        &self,
        request: &[u8],
        skip_cache_update: bool,
        as_string: bool,
        min_write_response: usize,
    ) -> Option<String> {
        let _guard = self.comm_lock.lock().await;
        let rx = self.link.rx();

        // Anything already buffered is stale, most likely from a request
        // that timed out before its response arrived.
        if !rx.is_empty() {
            self.counters.unexpected_data.fetch_add(1, Ordering::Relaxed);
            warn!("[Engine] Flushing unexpected data, likely a late response");
            self.link.flush().await;
        }

        if let Err(e) = self.link.write(request).await {
            error!("[Engine] Failed to send request: {e}");
            return None;
        }
        self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        let sent_at = Instant::now();

        let response = loop {
            // The response takes at least two character times to arrive, so
            // sleep before polling rather than after.
            rx.wait_for_data(self.poll_tick).await;
            if self.stop.is_cancelled() {
                return None;
            }

            match self.codec.poll_frame(rx, min_write_response) {
                FrameStatus::Complete(frame) => {
                    self.counters
                        .total_latency_us
                        .fetch_add(sent_at.elapsed().as_micros() as u64, Ordering::Relaxed);
                    break frame;
                }
                FrameStatus::Failed => {
                    error!(
                        "[Engine] Error receiving response for register {:04x}",
                        register_from_frame(request).unwrap_or(0)
                    );
                    self.link.flush().await;
                    return None;
                }
                FrameStatus::Pending => {
                    if sent_at.elapsed() > self.packet_timeout {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "[Engine] Timeout receiving response for register {:04x}, buffer length {}",
                            register_from_frame(request).unwrap_or(0),
                            rx.len()
                        );
                        if !rx.is_empty() {
                            error!("[Engine] Buffer: {}", hex::encode(rx.peek(rx.len())));
                        }
                        self.link.flush().await;
                        return None;
                    }
                }
            }
        };

        match self.update_registers(request, &response, skip_cache_update, as_string) {
            Some(value) => Some(value),
            None => {
                self.counters
                    .validation_errors
                    .fetch_add(1, Ordering::Relaxed);
                error!("[Engine] Master frame: {}", hex::encode(request));
                error!("[Engine] Slave frame: {}", hex::encode(&response));
                self.link.flush().await;
                None
            }
        }
    }

    /// Validate a request/response pair and extract the register value.
    ///
    /// Returns `None` on any mismatch; the caller counts it as a
    /// validation error and flushes.
    fn update_registers(
        &self,
        master: &[u8],
        slave: &[u8],
        skip_cache_update: bool,
        as_string: bool,
    ) -> Option<String> {
        let register = register_from_frame(master)?;

        // Replies on the encapsulation register belong to the unlock
        // exchange and never reach the register cache.
        if self.encapsulation_register == Some(register)
            && master.get(OFF_FUNCTION) == Some(&FUNC_WRITE_REGS)
        {
            debug!("[Engine] Encapsulation response sent/received");
            return Some(String::new());
        }

        if master.len() < MIN_RESPONSE_LEN || slave.len() < MIN_RESPONSE_LEN {
            error!(
                "[Engine] Validation error, length: master {}, slave {}",
                master.len(),
                slave.len()
            );
            return None;
        }
        if master[OFF_ADDRESS] != self.codec.slave_address() {
            error!("[Engine] Validation error: invalid master address");
            return None;
        }
        if !self.codec.accepts_address(slave[OFF_ADDRESS]) {
            error!("[Engine] Validation error: invalid slave address");
            return None;
        }
        let known = [self.codec.read_function(), FUNC_WRITE_REGS, FUNC_READ_FILE];
        if !known.contains(&slave[OFF_FUNCTION]) {
            error!(
                "[Engine] Validation error: unknown function in response: {:02x} {:02x}",
                slave[OFF_ADDRESS], slave[OFF_FUNCTION]
            );
            return None;
        }
        if !known.contains(&master[OFF_FUNCTION]) {
            error!(
                "[Engine] Validation error: unknown function in request: {:02x} {:02x}",
                master[OFF_ADDRESS], master[OFF_FUNCTION]
            );
            return None;
        }
        if master[OFF_FUNCTION] != slave[OFF_FUNCTION] {
            error!(
                "[Engine] Validation error: function mismatch: {:02x} vs {:02x}",
                master[OFF_FUNCTION], slave[OFF_FUNCTION]
            );
            return None;
        }
        if master[OFF_FUNCTION] == FUNC_WRITE_REGS {
            let echoed = register_from_frame(slave)?;
            if echoed != register {
                error!(
                    "[Engine] Validation error: register mismatch: {:04x} vs {:04x}",
                    register, echoed
                );
                return None;
            }
        }

        let mut value = String::new();
        let mut string_value = String::new();
        let mut is_file = false;

        if master[OFF_FUNCTION] == self.codec.read_function() {
            let length = slave[OFF_RESPONSE_LEN] as usize;
            if length + RESPONSE_OVERHEAD > slave.len() {
                error!(
                    "[Engine] Validation error: declared length {} exceeds frame of {}",
                    length,
                    slave.len()
                );
                return None;
            }
            let payload = &slave[OFF_READ_DATA..OFF_READ_DATA + length];
            value = hex::encode(payload);
            if as_string {
                string_value = payload.iter().filter(|&&b| b != 0).map(|&b| b as char).collect();
            }
        } else if master[OFF_FUNCTION] == FUNC_READ_FILE {
            is_file = true;
            let payload_len = (slave[OFF_FILE_PAYLOAD_LEN] as usize).saturating_sub(1);
            if OFF_FILE_PAYLOAD + payload_len > slave.len() {
                error!(
                    "[Engine] Validation error: file payload length {} exceeds frame of {}",
                    payload_len,
                    slave.len()
                );
                return None;
            }
            let payload = &slave[OFF_FILE_PAYLOAD..OFF_FILE_PAYLOAD + payload_len];
            value = hex::encode(payload);
            if as_string {
                string_value = payload.iter().filter(|&&b| b != 0).map(|&b| b as char).collect();
            }
        }

        if !skip_cache_update && master[OFF_FUNCTION] != FUNC_WRITE_REGS {
            let key = format!("{register:04x}");
            let accepted = if as_string {
                self.sink.update(&key, &string_value, true, is_file)
            } else {
                self.sink.update(&key, &value, false, is_file)
            };
            if !accepted {
                self.counters.sync_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        if as_string {
            Some(string_value)
        } else {
            Some(value)
        }
    }

    /// Discard device queues and the receive buffer, for manual
    /// resynchronization between retries.
    pub async fn flush(&self) {
        self.link.flush().await;
    }

    /// Statistics snapshot including the link's own counters.
    pub fn stats(&self) -> CommStats {
        self.counters
            .snapshot(self.link.rx().discarded_bytes(), self.link.restarts())
    }

    /// Reset counters and the rate-measurement window.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Current receive buffer rendered as text, for diagnostics.
    pub fn rx_buffer_as_string(&self) -> String {
        self.link.rx().as_string()
    }

    /// Signal any in-flight transaction to abandon its wait.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and close the underlying link.
    pub async fn close(&mut self) {
        self.stop.cancel();
        self.link.close().await;
    }

    pub(crate) fn counters(&self) -> &Arc<CommCounters> {
        &self.counters
    }

    pub(crate) fn build_read_request(&self, register: u16, length_words: u16) -> Option<Vec<u8>> {
        self.codec.build_read_request(register, length_words)
    }

    pub(crate) fn set_encapsulation_register(&mut self, register: Option<u16>) {
        self.encapsulation_register = register;
    }

    #[cfg(test)]
    pub(crate) fn packet_timeout(&self) -> Duration {
        self.packet_timeout
    }
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("link", &self.link)
            .field("packet_timeout", &self.packet_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialConfig;
    use crate::registers::NullSink;
    use crate::transport::MockLink;

    #[test]
    fn test_packet_timeout_at_9600_baud() {
        let timeout = compute_packet_timeout(9600, Duration::ZERO, Duration::ZERO);
        // ~20ms of character time plus the 3s settling margin
        assert_eq!(timeout, Duration::from_millis(3020));
    }

    #[test]
    fn test_packet_timeout_additional_and_padding() {
        let timeout = compute_packet_timeout(
            9600,
            Duration::from_millis(500),
            Duration::from_millis(2000),
        );
        assert_eq!(timeout, Duration::from_millis(5520));
    }

    #[test]
    fn test_engine_timeout_reflects_transport() {
        let config = EngineConfig {
            transport: TransportConfig::Serial(SerialConfig {
                baud_rate: 9600,
                ..Default::default()
            }),
            ..Default::default()
        };
        let engine =
            TransactionEngine::with_link(config, Box::new(MockLink::new()), Arc::new(NullSink));
        assert_eq!(engine.packet_timeout(), Duration::from_millis(3020));
    }
}
