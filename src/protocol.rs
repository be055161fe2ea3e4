//! OpenBCI V3 serial wire protocol.
//!
//! A packet on the wire is 33 bytes:
//!
//! ```text
//! 0xA0 | id | 8 x 24-bit channel (big-endian) | 3 x 16-bit aux (big-endian) | 0xC0
//! ```
//!
//! Host-to-device control is a single ASCII byte per command.

use crate::errors::{DriverError, Result};

// ============================================================================
// Framing
// ============================================================================

pub const START_BYTE: u8 = 0xA0;
pub const END_BYTE: u8 = 0xC0;

/// EEG channels carried by one packet (one board).
pub const CHANNELS_PER_PACKET: usize = 8;
/// Accelerometer channels carried by one packet.
pub const AUX_PER_PACKET: usize = 3;

pub const BYTES_PER_CHANNEL: usize = 3;
pub const BYTES_PER_AUX: usize = 2;

/// Samples per second on the raw link.
pub const SAMPLE_RATE_HZ: f64 = 250.0;

// ============================================================================
// Identification banner
// ============================================================================

/// Marker the firmware prints after its boot banner.
pub const BANNER_TERMINATOR: &[u8] = b"$$$";
/// Substring identifying an OpenBCI board in the banner.
pub const DEVICE_ID_MARKER: &str = "OpenBCI";
/// Substring (case-insensitive) announcing an attached daisy module.
pub const DAISY_MARKER: &str = "daisy";

// ============================================================================
// Scaling
// ============================================================================

/// ADS1299 reference voltage in volts.
pub const ADS1299_VREF: f64 = 4.5;
/// ADS1299 programmable gain set by the firmware at boot.
pub const ADS1299_GAIN: f64 = 24.0;

/// Microvolts per ADC count.
pub const SCALE_UV_PER_COUNT: f64 = ADS1299_VREF / ADS1299_GAIN / 8_388_608.0 * 1_000_000.0;

/// g per accelerometer count (LIS3DH at +/-4g, 12-bit left-justified).
pub const SCALE_G_PER_COUNT: f64 = 0.002 / 16.0;

// ============================================================================
// Control bytes
// ============================================================================

pub const CMD_START_STREAM: u8 = b'b';
pub const CMD_STOP_STREAM: u8 = b's';
pub const CMD_SOFT_RESET: u8 = b'?';
pub const CMD_FILTERS_ON: u8 = b'f';
pub const CMD_FILTERS_OFF: u8 = b'g';

/// Channel 1..=16 deactivation bytes, indexed by `channel - 1`.
const CHANNEL_OFF: &[u8; 16] = b"12345678qwertyui";
/// Channel 1..=16 activation bytes, indexed by `channel - 1`.
const CHANNEL_ON: &[u8; 16] = b"!@#$%^&*QWERTYUI";

/// Internal test signals the ADS1299 can route to every input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSignal {
    /// Inputs shorted to ground.
    Ground,
    /// Inputs tied to Vcc.
    Vcc,
    /// 1x amplitude square wave, slow.
    Pulse1xSlow,
    /// 1x amplitude square wave, fast.
    Pulse1xFast,
    /// 2x amplitude square wave, slow.
    Pulse2xSlow,
    /// 2x amplitude square wave, fast.
    Pulse2xFast,
}

impl TestSignal {
    pub fn command(self) -> u8 {
        match self {
            TestSignal::Ground => b'0',
            TestSignal::Vcc => b'p',
            TestSignal::Pulse1xSlow => b'-',
            TestSignal::Pulse1xFast => b'=',
            TestSignal::Pulse2xSlow => b'[',
            TestSignal::Pulse2xFast => b']',
        }
    }

    /// Map the numeric selector used by the OpenBCI tooling (0-5).
    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            0 => Ok(TestSignal::Ground),
            1 => Ok(TestSignal::Vcc),
            2 => Ok(TestSignal::Pulse1xSlow),
            3 => Ok(TestSignal::Pulse1xFast),
            4 => Ok(TestSignal::Pulse2xSlow),
            5 => Ok(TestSignal::Pulse2xFast),
            _ => Err(DriverError::InvalidArgument(format!(
                "unknown test signal {index} (expected 0-5)"
            ))),
        }
    }
}

/// Control byte that switches `channel` (1-based) on or off.
///
/// `channel_count` is 8 for a single board, 16 with a daisy module.
pub fn channel_command(channel: u8, on: bool, channel_count: usize) -> Result<u8> {
    let idx = usize::from(channel);
    if idx == 0 || idx > channel_count.min(CHANNEL_ON.len()) {
        return Err(DriverError::InvalidArgument(format!(
            "channel {channel} out of range 1..={channel_count}"
        )));
    }
    let table = if on { CHANNEL_ON } else { CHANNEL_OFF };
    Ok(table[idx - 1])
}

// ============================================================================
// Field decoding
// ============================================================================

/// Interpret 3 big-endian bytes as a sign-extended 24-bit integer.
#[inline]
pub fn interpret_24bit_as_i32(bytes: [u8; 3]) -> i32 {
    let prefix = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    i32::from_be_bytes([prefix, bytes[0], bytes[1], bytes[2]])
}

/// Interpret 2 big-endian bytes as a signed 16-bit integer.
#[inline]
pub fn interpret_16bit_as_i16(bytes: [u8; 2]) -> i16 {
    i16::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_24bit_sign_extension() {
        assert_eq!(interpret_24bit_as_i32([0x00, 0x00, 0x00]), 0);
        assert_eq!(interpret_24bit_as_i32([0x7F, 0xFF, 0xFF]), 8_388_607);
        assert_eq!(interpret_24bit_as_i32([0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(interpret_24bit_as_i32([0x80, 0x00, 0x00]), -8_388_608);
        assert_eq!(interpret_24bit_as_i32([0x00, 0x01, 0x02]), 0x0102);
    }

    #[test]
    fn test_16bit_aux() {
        assert_eq!(interpret_16bit_as_i16([0x00, 0x10]), 16);
        assert_eq!(interpret_16bit_as_i16([0xFF, 0xF0]), -16);
    }

    #[test]
    fn test_scale_factor_value() {
        // 4.5 V / 24 / 2^23 in microvolts
        assert!((SCALE_UV_PER_COUNT - 0.022_351_741_790_771_484).abs() < 1e-12);
        assert!((SCALE_G_PER_COUNT - 0.000_125).abs() < 1e-12);
    }

    #[test]
    fn test_channel_commands() {
        assert_eq!(channel_command(1, false, 8).unwrap(), b'1');
        assert_eq!(channel_command(8, true, 8).unwrap(), b'*');
        assert_eq!(channel_command(9, false, 16).unwrap(), b'q');
        assert_eq!(channel_command(16, true, 16).unwrap(), b'I');
        assert!(channel_command(0, true, 8).is_err());
        assert!(channel_command(9, true, 8).is_err());
        assert!(channel_command(17, true, 16).is_err());
    }

    #[test]
    fn test_signal_selector() {
        assert_eq!(TestSignal::from_index(0).unwrap().command(), b'0');
        assert_eq!(TestSignal::from_index(3).unwrap(), TestSignal::Pulse1xFast);
        assert!(TestSignal::from_index(6).is_err());
    }
}
