//! Board configuration.
//!
//! `BoardConfig` is fixed once the link is open. It deserializes from any serde
//! format with missing fields taking their defaults; durations are expressed as
//! floating-point seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Default serial baud rate for the OpenBCI dongle
pub const DEFAULT_BAUD: u32 = 115200;

/// Default per-read timeout; a read that returns nothing for this long is a stall
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default watchdog period
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Dropped packets tolerated between two watchdog ticks
pub const DEFAULT_MAX_DROPPED: u32 = 10;

/// Time the board needs after the port opens before it accepts commands
pub const DEFAULT_BOOT_DELAY: Duration = Duration::from_secs(2);

/// Pause between the steps of a reconnect
pub const DEFAULT_RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// Read timeout while probing candidate ports
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Serial port name. Auto-detected when `None`.
    pub port: Option<String>,
    pub baud: u32,
    /// Expect a daisy module. Overridden when the boot banner reports one.
    pub daisy: bool,
    /// Enable the on-board notch/bandpass filters.
    pub filtering: bool,
    /// Convert counts to microvolts / g. When off, raw counts are delivered.
    pub scaling: bool,
    /// Verbose per-packet diagnostics.
    pub logging: bool,
    #[serde(with = "secs")]
    pub read_timeout: Duration,
    /// Run the link-health watchdog while streaming.
    pub watchdog: bool,
    #[serde(with = "secs")]
    pub reconnect_interval: Duration,
    pub max_dropped_before_reconnect: u32,
    #[serde(with = "secs")]
    pub boot_delay: Duration,
    #[serde(with = "secs")]
    pub reconnect_pause: Duration,
    #[serde(with = "secs")]
    pub probe_timeout: Duration,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: DEFAULT_BAUD,
            daisy: false,
            filtering: true,
            scaling: true,
            logging: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            watchdog: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_dropped_before_reconnect: DEFAULT_MAX_DROPPED,
            boot_delay: DEFAULT_BOOT_DELAY,
            reconnect_pause: DEFAULT_RECONNECT_PAUSE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl BoardConfig {
    /// Config for a known port with everything else defaulted.
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud == 0 {
            return Err(DriverError::InvalidArgument("baud must be non-zero".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(DriverError::InvalidArgument(
                "read_timeout must be non-zero".into(),
            ));
        }
        if self.watchdog && self.reconnect_interval.is_zero() {
            return Err(DriverError::InvalidArgument(
                "reconnect_interval must be non-zero when the watchdog is enabled".into(),
            ));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BoardConfig::default();
        assert_eq!(cfg.baud, 115200);
        assert!(cfg.port.is_none());
        assert!(!cfg.daisy);
        assert!(cfg.scaling);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: BoardConfig =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB0", "daisy": true, "read_timeout": 0.25}"#)
                .unwrap();
        assert_eq!(cfg.port.as_deref(), Some("/dev/ttyUSB0"));
        assert!(cfg.daisy);
        assert_eq!(cfg.read_timeout, Duration::from_millis(250));
        assert_eq!(cfg.baud, DEFAULT_BAUD);
        assert_eq!(cfg.max_dropped_before_reconnect, DEFAULT_MAX_DROPPED);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let res: std::result::Result<BoardConfig, _> =
            serde_json::from_str(r#"{"reconnect_interval": -1.0}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_serialize_durations_as_seconds() {
        let value = serde_json::to_value(BoardConfig::with_port("COM3")).unwrap();
        assert_eq!(value["reconnect_interval"], serde_json::json!(2.0));
        assert_eq!(value["port"], serde_json::json!("COM3"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let cfg = BoardConfig {
            baud: 0,
            ..BoardConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DriverError::InvalidArgument(_))));

        let cfg = BoardConfig {
            read_timeout: Duration::ZERO,
            ..BoardConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BoardConfig {
            watchdog: false,
            reconnect_interval: Duration::ZERO,
            ..BoardConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
