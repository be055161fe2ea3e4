//! Serial port discovery.
//!
//! Every candidate port is opened, soft-reset and asked for its banner. The
//! full candidate list is always probed; when several ports answer, the last
//! one probed wins.

use std::io::Write;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::config::BoardConfig;
use crate::errors::{DriverError, Result};
use crate::link::read_banner;
use crate::protocol::{CMD_SOFT_RESET, DEVICE_ID_MARKER};

#[derive(Debug, Clone)]
pub struct PortLocator {
    pub baud: u32,
    /// Read timeout while waiting for a banner.
    pub probe_timeout: Duration,
    /// Pause between opening a port and sending the reset byte.
    pub settle: Duration,
}

impl PortLocator {
    pub fn new(baud: u32, probe_timeout: Duration) -> Self {
        Self {
            baud,
            probe_timeout,
            settle: Duration::ZERO,
        }
    }

    pub fn from_config(config: &BoardConfig) -> Self {
        Self {
            baud: config.baud,
            probe_timeout: config.probe_timeout,
            settle: config.boot_delay,
        }
    }

    /// Names of the serial ports the OS reports, in OS order.
    pub fn candidates() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn locate(&self) -> Result<String> {
        let candidates = Self::candidates()?;
        debug!("probing {} serial ports", candidates.len());
        locate_among(&candidates, |port| self.probe(port))
    }

    /// Open `port`, reset the board and look for the identification marker.
    pub fn probe(&self, port: &str) -> Result<bool> {
        let mut serial = serialport::new(port, self.baud)
            .timeout(self.probe_timeout)
            .open()?;
        thread::sleep(self.settle);
        serial.write_all(&[CMD_SOFT_RESET])?;
        serial.flush()?;
        let banner = read_banner(&mut serial, self.probe_timeout)?;
        Ok(banner.contains(DEVICE_ID_MARKER))
    }
}

/// Probe every candidate and return the last one that identified itself.
pub fn locate_among<S, F>(candidates: &[S], mut probe: F) -> Result<String>
where
    S: AsRef<str>,
    F: FnMut(&str) -> Result<bool>,
{
    let mut found = None;
    for port in candidates.iter().map(AsRef::as_ref) {
        match probe(port) {
            Ok(true) => {
                debug!("{} answered the identification probe", port);
                found = Some(port.to_string());
            }
            Ok(false) => debug!("{} did not identify as an OpenBCI board", port),
            Err(e) => debug!("{} could not be probed: {}", port, e),
        }
    }
    let port = found.ok_or(DriverError::PortNotFound)?;
    info!("found OpenBCI board on {}", port);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_candidates() {
        let none: [&str; 0] = [];
        assert!(matches!(
            locate_among(&none, |_| Ok(true)),
            Err(DriverError::PortNotFound)
        ));
    }

    #[test]
    fn test_no_port_answers() {
        let ports = ["/dev/ttyS0", "/dev/ttyS1"];
        assert!(matches!(
            locate_among(&ports, |_| Ok(false)),
            Err(DriverError::PortNotFound)
        ));
    }

    #[test]
    fn test_last_match_wins_and_all_probed() {
        let ports = ["/dev/ttyUSB0", "/dev/ttyS0", "/dev/ttyUSB1", "/dev/ttyS1"];
        let mut probed = Vec::new();
        let port = locate_among(&ports, |p| {
            probed.push(p.to_string());
            Ok(p.contains("USB"))
        })
        .unwrap();
        assert_eq!(port, "/dev/ttyUSB1");
        assert_eq!(probed.len(), 4);
    }

    #[test]
    fn test_probe_errors_are_skipped() {
        let ports = vec!["busy".to_string(), "board".to_string()];
        let port = locate_among(&ports, |p| {
            if p == "busy" {
                Err(DriverError::Io(std::io::Error::other("port busy")))
            } else {
                Ok(true)
            }
        })
        .unwrap();
        assert_eq!(port, "board");
    }
}
