use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no OpenBCI board answered the identification probe on any serial port")]
    PortNotFound,
    #[error("device appears to be stalled: read timed out with no bytes")]
    DeviceStalled,
    #[error("link not connected")]
    NotConnected,
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
