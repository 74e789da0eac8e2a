//! Communication statistics.
//!
//! All error classes observed on the link are counted in a single
//! [`CommCounters`] struct owned by the engine instance. Counters only ever
//! increase; [`CommCounters::reset`] is the one explicit reset point (used
//! by callers around time-sync events, since the rate figures are
//! wall-clock based).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Modbus exception response kinds, one per defined exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalAddress,
    IllegalData,
    SlaveFailure,
    Acknowledge,
    SlaveBusy,
    NegativeAcknowledge,
    MemoryParity,
    GatewayPath,
    GatewayTarget,
    Unknown,
}

impl ExceptionKind {
    /// Map a wire exception code to its kind.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalAddress,
            0x03 => Self::IllegalData,
            0x04 => Self::SlaveFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParity,
            0x0a => Self::GatewayPath,
            0x0b => Self::GatewayTarget,
            _ => Self::Unknown,
        }
    }

    /// Human-readable description for logs.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalAddress => "Illegal Address",
            Self::IllegalData => "Illegal Data Value",
            Self::SlaveFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveBusy => "Slave Device Busy",
            Self::NegativeAcknowledge => "Negative Acknowledge",
            Self::MemoryParity => "Memory Parity Error",
            Self::GatewayPath => "Gateway Path Unavailable",
            Self::GatewayTarget => "Gateway Target Device Failed to Respond",
            Self::Unknown => "Unknown",
        }
    }
}

/// Per-kind exception counts in a stats snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExceptionStats {
    pub illegal_function: u64,
    pub illegal_address: u64,
    pub illegal_data: u64,
    pub slave_failure: u64,
    pub acknowledge: u64,
    pub slave_busy: u64,
    pub negative_acknowledge: u64,
    pub memory_parity: u64,
    pub gateway_path: u64,
    pub gateway_target: u64,
    pub unknown: u64,
}

/// Point-in-time statistics snapshot, suitable for a dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct CommStats {
    /// Packets sent as master
    pub tx_packets: u64,
    /// Packets received from the slave
    pub rx_packets: u64,
    pub crc_errors: u64,
    pub crc_error_percent: f64,
    pub timeouts: u64,
    pub timeout_percent: f64,
    /// Total exception responses
    pub modbus_exceptions: u64,
    pub exceptions: ExceptionStats,
    pub validation_errors: u64,
    pub sync_errors: u64,
    /// Stale bytes found in the buffer before a new request
    pub unexpected_data: u64,
    /// Bytes dropped during resynchronization
    pub discarded_bytes: u64,
    /// Link reader restarts after I/O errors
    pub restarts: u64,
    pub packets_per_second: f64,
    pub avg_transaction_time_ms: f64,
    /// Start of the current measurement window
    pub since: DateTime<Utc>,
}

/// Process-lifetime communication counters.
#[derive(Debug)]
pub struct CommCounters {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub crc_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub validation_errors: AtomicU64,
    pub sync_errors: AtomicU64,
    pub unexpected_data: AtomicU64,
    pub exceptions: AtomicU64,
    excep_function: AtomicU64,
    excep_address: AtomicU64,
    excep_data: AtomicU64,
    excep_slave_failure: AtomicU64,
    excep_acknowledge: AtomicU64,
    excep_busy: AtomicU64,
    excep_nack: AtomicU64,
    excep_memory_parity: AtomicU64,
    excep_gateway: AtomicU64,
    excep_gateway_target: AtomicU64,
    excep_unknown: AtomicU64,
    /// Cumulative request-to-response latency in microseconds
    pub total_latency_us: AtomicU64,
    started_at: Mutex<DateTime<Utc>>,
}

impl CommCounters {
    pub fn new() -> Self {
        Self {
            tx_packets: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            crc_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            sync_errors: AtomicU64::new(0),
            unexpected_data: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            excep_function: AtomicU64::new(0),
            excep_address: AtomicU64::new(0),
            excep_data: AtomicU64::new(0),
            excep_slave_failure: AtomicU64::new(0),
            excep_acknowledge: AtomicU64::new(0),
            excep_busy: AtomicU64::new(0),
            excep_nack: AtomicU64::new(0),
            excep_memory_parity: AtomicU64::new(0),
            excep_gateway: AtomicU64::new(0),
            excep_gateway_target: AtomicU64::new(0),
            excep_unknown: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            started_at: Mutex::new(Utc::now()),
        }
    }

    /// Record an exception response by kind.
    pub fn record_exception(&self, code: u8) -> ExceptionKind {
        let kind = ExceptionKind::from_code(code);
        self.exceptions.fetch_add(1, Ordering::Relaxed);
        self.kind_counter(kind).fetch_add(1, Ordering::Relaxed);
        kind
    }

    /// Number of Acknowledge exceptions seen so far.
    ///
    /// Controllers that require the encapsulation unlock reject plain
    /// requests with Acknowledge, so this counter drives the unlock policy.
    pub fn acknowledge_count(&self) -> u64 {
        self.excep_acknowledge.load(Ordering::Relaxed)
    }

    /// Count for a single exception kind.
    pub fn exception_count(&self, kind: ExceptionKind) -> u64 {
        self.kind_counter(kind).load(Ordering::Relaxed)
    }

    fn kind_counter(&self, kind: ExceptionKind) -> &AtomicU64 {
        match kind {
            ExceptionKind::IllegalFunction => &self.excep_function,
            ExceptionKind::IllegalAddress => &self.excep_address,
            ExceptionKind::IllegalData => &self.excep_data,
            ExceptionKind::SlaveFailure => &self.excep_slave_failure,
            ExceptionKind::Acknowledge => &self.excep_acknowledge,
            ExceptionKind::SlaveBusy => &self.excep_busy,
            ExceptionKind::NegativeAcknowledge => &self.excep_nack,
            ExceptionKind::MemoryParity => &self.excep_memory_parity,
            ExceptionKind::GatewayPath => &self.excep_gateway,
            ExceptionKind::GatewayTarget => &self.excep_gateway_target,
            ExceptionKind::Unknown => &self.excep_unknown,
        }
    }

    /// Build a snapshot, folding in the transport-owned counters.
    pub fn snapshot(&self, discarded_bytes: u64, restarts: u64) -> CommStats {
        let tx = self.tx_packets.load(Ordering::Relaxed);
        let rx = self.rx_packets.load(Ordering::Relaxed);
        let crc = self.crc_errors.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let since = *self.started_at.lock();

        let percent = |errors: u64| {
            if errors == 0 || tx == 0 {
                0.0
            } else {
                errors as f64 / tx as f64 * 100.0
            }
        };

        let elapsed = (Utc::now() - since).num_milliseconds().max(1) as f64 / 1000.0;
        let avg_ms = if rx == 0 {
            0.0
        } else {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / rx as f64 / 1000.0
        };

        CommStats {
            tx_packets: tx,
            rx_packets: rx,
            crc_errors: crc,
            crc_error_percent: percent(crc),
            timeouts,
            timeout_percent: percent(timeouts),
            modbus_exceptions: self.exceptions.load(Ordering::Relaxed),
            exceptions: ExceptionStats {
                illegal_function: self.excep_function.load(Ordering::Relaxed),
                illegal_address: self.excep_address.load(Ordering::Relaxed),
                illegal_data: self.excep_data.load(Ordering::Relaxed),
                slave_failure: self.excep_slave_failure.load(Ordering::Relaxed),
                acknowledge: self.excep_acknowledge.load(Ordering::Relaxed),
                slave_busy: self.excep_busy.load(Ordering::Relaxed),
                negative_acknowledge: self.excep_nack.load(Ordering::Relaxed),
                memory_parity: self.excep_memory_parity.load(Ordering::Relaxed),
                gateway_path: self.excep_gateway.load(Ordering::Relaxed),
                gateway_target: self.excep_gateway_target.load(Ordering::Relaxed),
                unknown: self.excep_unknown.load(Ordering::Relaxed),
            },
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            unexpected_data: self.unexpected_data.load(Ordering::Relaxed),
            discarded_bytes,
            restarts,
            packets_per_second: (tx + rx) as f64 / elapsed,
            avg_transaction_time_ms: avg_ms,
            since,
        }
    }

    /// Reset every counter and restart the measurement window.
    pub fn reset(&self) {
        self.tx_packets.store(0, Ordering::Relaxed);
        self.rx_packets.store(0, Ordering::Relaxed);
        self.crc_errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.validation_errors.store(0, Ordering::Relaxed);
        self.sync_errors.store(0, Ordering::Relaxed);
        self.unexpected_data.store(0, Ordering::Relaxed);
        self.exceptions.store(0, Ordering::Relaxed);
        self.excep_function.store(0, Ordering::Relaxed);
        self.excep_address.store(0, Ordering::Relaxed);
        self.excep_data.store(0, Ordering::Relaxed);
        self.excep_slave_failure.store(0, Ordering::Relaxed);
        self.excep_acknowledge.store(0, Ordering::Relaxed);
        self.excep_busy.store(0, Ordering::Relaxed);
        self.excep_nack.store(0, Ordering::Relaxed);
        self.excep_memory_parity.store(0, Ordering::Relaxed);
        self.excep_gateway.store(0, Ordering::Relaxed);
        self.excep_gateway_target.store(0, Ordering::Relaxed);
        self.excep_unknown.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        *self.started_at.lock() = Utc::now();
    }
}

impl Default for CommCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_kind_mapping() {
        assert_eq!(ExceptionKind::from_code(0x01), ExceptionKind::IllegalFunction);
        assert_eq!(ExceptionKind::from_code(0x05), ExceptionKind::Acknowledge);
        assert_eq!(ExceptionKind::from_code(0x0a), ExceptionKind::GatewayPath);
        assert_eq!(ExceptionKind::from_code(0x0b), ExceptionKind::GatewayTarget);
        assert_eq!(ExceptionKind::from_code(0x7f), ExceptionKind::Unknown);
    }

    #[test]
    fn test_record_exception_increments_one_kind() {
        let counters = CommCounters::new();
        counters.record_exception(0x05);
        assert_eq!(counters.exceptions.load(Ordering::Relaxed), 1);
        assert_eq!(counters.acknowledge_count(), 1);
        assert_eq!(counters.exception_count(ExceptionKind::SlaveBusy), 0);
        assert_eq!(counters.exception_count(ExceptionKind::IllegalFunction), 0);
    }

    #[test]
    fn test_snapshot_percentages() {
        let counters = CommCounters::new();
        counters.tx_packets.store(200, Ordering::Relaxed);
        counters.crc_errors.store(2, Ordering::Relaxed);
        counters.timeouts.store(1, Ordering::Relaxed);
        let stats = counters.snapshot(7, 1);
        assert!((stats.crc_error_percent - 1.0).abs() < f64::EPSILON);
        assert!((stats.timeout_percent - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.discarded_bytes, 7);
        assert_eq!(stats.restarts, 1);
    }

    #[test]
    fn test_reset_clears_counters() {
        let counters = CommCounters::new();
        counters.tx_packets.store(5, Ordering::Relaxed);
        counters.record_exception(0x06);
        counters.reset();
        let stats = counters.snapshot(0, 0);
        assert_eq!(stats.tx_packets, 0);
        assert_eq!(stats.modbus_exceptions, 0);
        assert_eq!(stats.exceptions.slave_busy, 0);
    }
}
