//! genlink - Modbus master engine for standby generator controllers.
//!
//! This library polls a proprietary generator controller over a
//! Modbus-derived serial or TCP link and feeds a caller-owned register
//! cache. It implements exact byte-level framing with CRC-16/MODBUS
//! validation, timeout and retry accounting under real-time serial
//! constraints, and the encrypted encapsulation handshake newer controller
//! firmware requires before it accepts standard Modbus traffic.
//!
//! # Architecture
//!
//! - [`transport`] - serial and TCP links, each with a background reader
//!   task filling a shared receive buffer
//! - [`frame`] - request construction and incremental response parsing
//! - [`engine`] - one-outstanding-request transaction engine with error
//!   counters and the register-update callback
//! - [`encapsulation`] - the unlock protocol wrapper and its AES/nibble
//!   scrambling envelope ([`crypto`])
//!
//! Register values are moved as opaque hex strings; what they mean is the
//! caller's concern. All protocol failures are counted, logged, and
//! surfaced as empty results rather than errors; callers seeing repeated
//! empty results should treat the register as temporarily unavailable and
//! consult [`engine::TransactionEngine::stats`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use genlink::registers::sink_fn;
//! use genlink::{EncapsulationConfig, EncapsulationEngine, EngineConfig, TransactionEngine};
//!
//! #[tokio::main]
//! async fn main() -> genlink::Result<()> {
//!     let sink = Arc::new(sink_fn(|register, value, _is_string, _is_file| {
//!         println!("{register} = {value}");
//!         true
//!     }));
//!
//!     let engine = TransactionEngine::connect(EngineConfig::default(), sink).await?;
//!     let engine = EncapsulationEngine::new(engine, EncapsulationConfig::default())?;
//!
//!     if let Some(value) = engine.process_read(0x0007, 1).await {
//!         println!("battery register: {value}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod encapsulation;
pub mod engine;
pub mod error;
pub mod frame;
pub mod registers;
pub mod stats;
pub mod transport;

pub use config::{
    EncapsulationConfig, EngineConfig, Parity, SerialConfig, StopBits, TcpConfig, TransportConfig,
};
pub use encapsulation::{EncapsulationEngine, ENCAPSULATION_REGISTER};
pub use engine::TransactionEngine;
pub use error::{LinkError, Result};
pub use registers::{sink_fn, NullSink, RegisterSink, SinkFn};
pub use stats::{CommStats, ExceptionKind};
pub use transport::{Link, MockLink, SerialLink, SharedRxBuffer, TcpLink};
