//! Encapsulation unlock protocol.
//!
//! Newer controller firmware starts rejecting plain Modbus requests with
//! Acknowledge exceptions once a session is considered unauthorized. The
//! recovery, reverse engineered from bus captures, is a three-step
//! "unlock" exchange written to a fixed encapsulation register: the
//! intended request is encrypted, scrambled with a fixed nibble-swap
//! transform, wrapped behind per-step command prefixes, and replayed. The
//! unlock is best effort; every step failure falls through to the normal
//! transaction attempt.
//!
//! [`EncapsulationEngine`] wraps a [`TransactionEngine`] and runs the
//! unlock ahead of reads and writes while the controller is rejecting
//! traffic, rate limited so the bus is not flooded with handshakes.

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::EncapsulationConfig;
use crate::crypto::{BlockCrypto, BLOCK_SIZE};
use crate::engine::TransactionEngine;
use crate::error::Result;
use crate::stats::CommStats;

/// Register the unlock exchange is addressed to.
pub const ENCAPSULATION_REGISTER: u16 = 0xea60;

const CMD_PREFIX: u8 = 0xf1;
const CMD_KEY_SELECT: u8 = 0x01;
const CMD_REPLAY: u8 = 0x51;
const CMD_COMMIT: u8 = 0xa7;

/// The controller's reply to the final step is shorter than a standard
/// write echo.
const COMMIT_MIN_RESPONSE_LEN: usize = 6;

/// Fixed key-selection block sent ahead of the ciphertext. The first byte
/// appears to select the cipher key; the marker at index 9 must be 0xe3.
const KEY_SELECT_BLOCK: [u8; BLOCK_SIZE] = [
    0x00, 0x00, 0x00, 0x05, 0x06, 0x02, 0x04, 0x04, 0x01, 0xe3, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

const CIPHER_IV: [u8; BLOCK_SIZE] = [
    0xc0, 0x94, 0xfb, 0xeb, 0xf5, 0x96, 0x43, 0x7f, 0xa2, 0x2e, 0xfa, 0x84, 0xfc, 0xc5, 0x21,
    0x52,
];

/// Key table observed in firmware captures; only the first entry is used.
const CIPHER_KEYS: [[u8; BLOCK_SIZE]; 16] = [
    [
        0x4a, 0x2a, 0xa3, 0xe4, 0x7e, 0xe0, 0x42, 0x2c, 0xa4, 0xbc, 0x8d, 0x1d, 0x52, 0xde,
        0xd9, 0x69,
    ],
    [
        0xee, 0xfa, 0x10, 0x27, 0x80, 0xe7, 0x4f, 0x03, 0xb7, 0xd0, 0x32, 0x58, 0xc4, 0xd7,
        0xf8, 0xe5,
    ],
    [
        0xfd, 0x79, 0xa9, 0xcf, 0xcf, 0x94, 0x40, 0x1d, 0x9a, 0x65, 0xa4, 0x7c, 0x97, 0xb3,
        0x0c, 0xc2,
    ],
    [
        0x55, 0x99, 0xf2, 0xfb, 0x0d, 0x70, 0x49, 0x1a, 0xbc, 0x85, 0xf4, 0x58, 0x9e, 0xc1,
        0x11, 0x48,
    ],
    [
        0xdb, 0xcf, 0x82, 0x6f, 0x42, 0xe8, 0x41, 0xde, 0xbd, 0x64, 0xbb, 0xac, 0x16, 0xfb,
        0xb4, 0xd3,
    ],
    [
        0x84, 0xa1, 0xa5, 0xf7, 0x26, 0xa3, 0x47, 0xfe, 0x8a, 0x0f, 0xb5, 0xf1, 0xc1, 0x9e,
        0xa3, 0xcf,
    ],
    [
        0x20, 0x9c, 0xd8, 0xdf, 0xab, 0x2e, 0x47, 0x3e, 0xa2, 0xbf, 0xfe, 0xea, 0xc1, 0xd4,
        0x87, 0x8e,
    ],
    [
        0xef, 0xa6, 0x7a, 0xd0, 0x81, 0xbc, 0x42, 0xeb, 0xb4, 0xde, 0x51, 0xae, 0x1a, 0x04,
        0x73, 0xa7,
    ],
    [
        0x17, 0x3e, 0x13, 0x55, 0x77, 0xc3, 0x4d, 0x46, 0xab, 0x2c, 0x5a, 0xd7, 0x95, 0x25,
        0xe7, 0x62,
    ],
    [
        0xcc, 0x8d, 0x8f, 0x2a, 0x3b, 0x1b, 0x44, 0x96, 0xbd, 0x8b, 0x78, 0x78, 0xf8, 0xb2,
        0xaf, 0x43,
    ],
    [
        0xa8, 0x50, 0x14, 0xdd, 0xe5, 0x38, 0x42, 0xdd, 0xa5, 0xe9, 0xa9, 0xad, 0xb1, 0xd4,
        0x84, 0xae,
    ],
    [
        0x24, 0x43, 0xce, 0xf9, 0x55, 0xcc, 0x42, 0xda, 0x95, 0x77, 0xf9, 0xed, 0xea, 0xe4,
        0x1a, 0xa1,
    ],
    [
        0x3a, 0xc2, 0x6f, 0x6a, 0xfe, 0x08, 0x40, 0xc1, 0x80, 0x46, 0x39, 0x95, 0x69, 0x1d,
        0x85, 0x2e,
    ],
    [
        0xa2, 0x42, 0x7b, 0x25, 0x57, 0x05, 0x43, 0x35, 0xb4, 0x79, 0x0a, 0x64, 0x66, 0x00,
        0x07, 0xf6,
    ],
    [
        0xfd, 0xb5, 0xcf, 0x6c, 0x7d, 0xe6, 0x42, 0xa7, 0x92, 0xb4, 0x3c, 0xc9, 0xc7, 0x7b,
        0x92, 0x57,
    ],
    [
        0xc7, 0x39, 0x70, 0xd5, 0xfc, 0xca, 0x43, 0x0c, 0x8e, 0xcd, 0xea, 0x54, 0xaf, 0x88,
        0xa3, 0x67,
    ],
];

/// Whether the controller is currently rejecting plain requests.
///
/// Derived live from the Acknowledge-exception count rather than stored,
/// so the mode can never drift from the counters that define it.
pub fn is_encapsulating(ack_exceptions: u64, threshold: u64) -> bool {
    ack_exceptions > threshold
}

/// Interleave nibbles between the two halves of a two-block buffer.
///
/// A fixed, order-sensitive scramble the firmware requires on the
/// encrypted envelope; it carries no meaning beyond obfuscation and has no
/// self-check, so the golden-fixture test below is the contract.
pub fn nybble_swap(buffer: &mut [u8]) {
    if buffer.len() != 2 * BLOCK_SIZE {
        warn!(
            "[Encapsulation] Invalid nibble swap buffer length: {}",
            buffer.len()
        );
        return;
    }
    for i in 0..BLOCK_SIZE {
        let t1 = buffer[i];
        let t2 = buffer[i + BLOCK_SIZE];
        if i % 2 == 0 {
            buffer[i] = (t2 << 4) | (t1 & 0x0f);
            buffer[i + BLOCK_SIZE] = (t1 >> 4) | (t2 & 0xf0);
        } else {
            buffer[i] = (t2 & 0xf0) | (t1 & 0x0f);
            buffer[i + BLOCK_SIZE] = (t1 & 0xf0) | (t2 & 0x0f);
        }
    }
}

#[derive(Debug)]
struct UnlockState {
    last_unlock: Option<Instant>,
    last_ack_count: u64,
}

/// Transaction engine front end that keeps the link authorized.
#[derive(Debug)]
pub struct EncapsulationEngine {
    engine: TransactionEngine,
    crypto: Mutex<BlockCrypto>,
    state: Mutex<UnlockState>,
    config: EncapsulationConfig,
}

impl EncapsulationEngine {
    /// Wrap an engine. Fails only if the cipher cannot be constructed.
    pub fn new(mut engine: TransactionEngine, config: EncapsulationConfig) -> Result<Self> {
        let crypto = BlockCrypto::new(&CIPHER_KEYS[0], &CIPHER_IV)?;
        engine.set_encapsulation_register(Some(ENCAPSULATION_REGISTER));
        let last_ack_count = engine.counters().acknowledge_count();
        Ok(Self {
            engine,
            crypto: Mutex::new(crypto),
            state: Mutex::new(UnlockState {
                last_unlock: None,
                last_ack_count,
            }),
            config,
        })
    }

    /// The wrapped engine, for stats and diagnostics.
    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub fn is_encapsulating(&self) -> bool {
        if self.config.bypass {
            return false;
        }
        is_encapsulating(
            self.engine.counters().acknowledge_count(),
            self.config.max_exceptions,
        )
    }

    pub async fn process_read(&self, register: u16, length_words: u16) -> Option<String> {
        self.process_read_opts(register, length_words, false, false)
            .await
    }

    pub async fn process_read_opts(
        &self,
        register: u16,
        length_words: u16,
        skip_cache_update: bool,
        as_string: bool,
    ) -> Option<String> {
        if self.is_encapsulating() {
            self.send_unlock_sequence(register, length_words).await;
        }
        self.engine
            .process_read_opts(register, length_words, skip_cache_update, as_string)
            .await
    }

    pub async fn process_write(&self, register: u16, length_words: u16, data: &[u8]) -> bool {
        if self.is_encapsulating() {
            self.send_unlock_sequence(register, length_words).await;
        }
        self.engine.process_write(register, length_words, data).await
    }

    pub async fn process_file_read(
        &self,
        register: u16,
        length_words: u16,
        file_num: u16,
    ) -> Option<String> {
        self.engine
            .process_file_read(register, length_words, file_num)
            .await
    }

    /// Run the three-step unlock exchange, rate limited.
    ///
    /// Executes only when the Acknowledge count moved since the last run,
    /// no run has happened yet, or the configured interval elapsed.
    /// Returns whether the sequence was attempted.
    async fn send_unlock_sequence(&self, register: u16, length_words: u16) -> bool {
        {
            let mut state = self.state.lock().await;
            let ack = self.engine.counters().acknowledge_count();
            let interval_elapsed = state
                .last_unlock
                .map_or(true, |t| t.elapsed() > self.config.unlock_interval);
            if ack == state.last_ack_count && !interval_elapsed {
                return false;
            }
            state.last_unlock = Some(Instant::now());
            state.last_ack_count = ack;
        }

        // The envelope always carries the read form of the intended request.
        let Some(request) = self.engine.build_read_request(register, length_words) else {
            return false;
        };
        let mut crypto = self.crypto.lock().await;

        // Step 1: key-selection block plus the encrypted request, scrambled.
        let mut key_and_ciphertext: Option<Vec<u8>> = None;
        match crypto.encrypt_buffer(&request, true) {
            Ok(ciphertext) => {
                let mut envelope = Vec::with_capacity(2 * BLOCK_SIZE);
                envelope.extend_from_slice(&KEY_SELECT_BLOCK);
                envelope.extend_from_slice(&ciphertext);
                let mut scrambled = envelope.clone();
                nybble_swap(&mut scrambled);
                let mut data = vec![CMD_PREFIX, CMD_KEY_SELECT];
                data.extend_from_slice(&scrambled);
                self.write_unlock_step(&data, None).await;
                key_and_ciphertext = Some(envelope);
            }
            Err(e) => error!("[Encapsulation] Unlock step 1 failed: {e}"),
        }

        // Step 2: the request alone, padded to two blocks, encrypted and
        // scrambled under the next command prefix.
        let mut padded = request.clone();
        padded.resize(2 * BLOCK_SIZE, 0);
        match crypto.encrypt_buffer(&padded, true) {
            Ok(mut scrambled) => {
                nybble_swap(&mut scrambled);
                let mut data = vec![CMD_PREFIX, CMD_REPLAY];
                data.extend_from_slice(&scrambled);
                self.write_unlock_step(&data, None).await;
            }
            Err(e) => error!("[Encapsulation] Unlock step 2 failed: {e}"),
        }

        // Step 3: the unscrambled step 1 envelope closes the exchange.
        if let Some(envelope) = key_and_ciphertext {
            let mut data = vec![CMD_PREFIX, CMD_COMMIT];
            data.extend_from_slice(&envelope);
            self.write_unlock_step(&data, Some(COMMIT_MIN_RESPONSE_LEN)).await;
        } else {
            error!("[Encapsulation] Unlock step 3 skipped, no envelope from step 1");
        }

        debug!("[Encapsulation] Unlock sequence sent for register {register:04x}");
        true
    }

    async fn write_unlock_step(&self, data: &[u8], min_response: Option<usize>) {
        let words = (data.len() / 2) as u16;
        self.engine
            .process_write_opts(ENCAPSULATION_REGISTER, words, data, min_response)
            .await;
    }

    pub async fn flush(&self) {
        self.engine.flush().await;
    }

    pub fn stats(&self) -> CommStats {
        self.engine.stats()
    }

    pub fn reset_stats(&self) {
        self.engine.reset_stats();
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub async fn close(&mut self) {
        self.engine.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_encapsulating_boundary() {
        assert!(!is_encapsulating(0, 2));
        assert!(!is_encapsulating(2, 2));
        assert!(is_encapsulating(3, 2));
    }

    #[test]
    fn test_nybble_swap_golden_fixture() {
        let mut buffer: Vec<u8> = (0u8..32).collect();
        nybble_swap(&mut buffer);
        let expected: [u8; 32] = [
            0x00, 0x11, 0x22, 0x13, 0x44, 0x15, 0x66, 0x17, 0x88, 0x19, 0xaa, 0x1b, 0xcc, 0x1d,
            0xee, 0x1f, 0x10, 0x01, 0x10, 0x03, 0x10, 0x05, 0x10, 0x07, 0x10, 0x09, 0x10, 0x0b,
            0x10, 0x0d, 0x10, 0x0f,
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn test_nybble_swap_rejects_other_lengths() {
        let mut short = vec![0xabu8; 16];
        let original = short.clone();
        nybble_swap(&mut short);
        assert_eq!(short, original);
    }

    #[test]
    fn test_unlock_constants() {
        assert_eq!(KEY_SELECT_BLOCK[9], 0xe3);
        assert_eq!(CIPHER_KEYS.len(), 16);
        assert_eq!(CIPHER_IV.len(), BLOCK_SIZE);
        assert_eq!(ENCAPSULATION_REGISTER, 0xea60);
    }
}
