//! Engine and transport configuration.
//!
//! Plain serde structs so callers can embed them in their own
//! configuration files. Every config validates before use; a bad
//! configuration refuses to start rather than limping along.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial stop bits.
///
/// Some controller serial ports are documented with 1.5 stop bits; the
/// underlying driver cannot express that, so `OnePointFive` is mapped to
/// two stop bits when the port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/serial0", "/dev/ttyUSB0")
    pub port: String,
    pub baud_rate: u32,
    /// 8 data bits, or 7 for older controllers
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Per-read poll timeout; short so the reader task observes stop
    /// signals promptly
    pub read_timeout: Duration,
    /// Long enough that a full frame is never truncated mid-write
    pub write_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(LinkError::ConfigError(
                "Serial port path cannot be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(LinkError::ConfigError(
                "Baud rate must be greater than zero".to_string(),
            ));
        }
        if ![7, 8].contains(&self.data_bits) {
            return Err(LinkError::ConfigError(
                "Data bits must be 7 or 8".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(LinkError::ConfigError(
                "Read timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// TCP link configuration, for serial-over-network bridges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Wait between reconnect attempts after a dropped connection
    pub reconnect_backoff: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8899,
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(10),
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(LinkError::ConfigError("Host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(LinkError::ConfigError("Port cannot be zero".to_string()));
        }
        Ok(())
    }
}

/// Which physical link the engine talks over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Tcp(TcpConfig),
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Serial(c) => c.validate(),
            Self::Tcp(c) => c.validate(),
        }
    }

    /// Baud rate used for timeout budgeting. TCP bridges still carry a
    /// serial line on the far side, so the nominal rate applies there too.
    pub fn baud_rate(&self) -> u32 {
        match self {
            Self::Serial(c) => c.baud_rate,
            Self::Tcp(_) => 9600,
        }
    }
}

/// Transaction engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    /// Modbus station address requests are sent to
    pub slave_address: u8,
    /// Alternate address accepted on responses
    pub response_address: Option<u8>,
    /// Extra allowance added to the computed per-transaction timeout
    pub additional_timeout: Duration,
    /// Poll the receive buffer less aggressively on slow hosts
    pub low_cpu_mode: bool,
    /// Read with function code 0x04 instead of 0x03
    pub use_input_registers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::Serial(SerialConfig::default()),
            slave_address: 0x9d,
            response_address: None,
            additional_timeout: Duration::ZERO,
            low_cpu_mode: false,
            use_input_registers: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}

/// Encapsulation unlock policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncapsulationConfig {
    /// Re-run the unlock sequence at most this often when nothing else
    /// forces it
    pub unlock_interval: Duration,
    /// Acknowledge-exception count above which the controller is treated
    /// as rejecting plain requests
    pub max_exceptions: u64,
    /// Never run the unlock sequence
    pub bypass: bool,
}

impl Default for EncapsulationConfig {
    fn default() -> Self {
        Self {
            unlock_interval: Duration::from_secs(3 * 60),
            max_exceptions: 2,
            bypass: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_validation() {
        let mut config = SerialConfig::default();
        assert!(config.validate().is_ok());

        config.port = String::new();
        assert!(config.validate().is_err());

        config.port = "/dev/ttyUSB0".to_string();
        config.baud_rate = 0;
        assert!(config.validate().is_err());

        config.baud_rate = 9600;
        config.data_bits = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tcp_config_validation() {
        let mut config = TcpConfig::default();
        assert!(config.validate().is_ok());

        config.host = String::new();
        assert!(config.validate().is_err());

        config.host = "10.0.0.5".to_string();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.slave_address, 0x9d);
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.baud_rate(), 9600);
    }

    #[test]
    fn test_encapsulation_config_defaults() {
        let config = EncapsulationConfig::default();
        assert_eq!(config.unlock_interval, Duration::from_secs(180));
        assert_eq!(config.max_exceptions, 2);
        assert!(!config.bypass);
    }

    #[test]
    fn test_transport_config_serde_round_trip() {
        let config = TransportConfig::Tcp(TcpConfig::default());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"tcp\""));
        let back: TransportConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, TransportConfig::Tcp(_)));
    }
}
