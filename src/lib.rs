//! OpenBCI serial driver with optional Python bindings.
//!
//! This crate talks to OpenBCI 8-channel boards (and the 16-channel daisy
//! expansion) over a USB serial dongle: it finds the port, performs the
//! reset handshake, decodes the 33-byte binary packets and hands scaled
//! samples to one or more consumers.
//!
//! # Packet layout
//!
//! ```text
//! 0xA0 | id | 8 x 24-bit channel | 3 x 16-bit aux | 0xC0
//! ```
//!
//! Channel values are big-endian two's complement and are scaled to
//! microvolts; aux values are scaled to g. With a daisy module the board
//! alternates odd (main board) and even (daisy) packet ids, and each odd/even
//! pair is fused into one 16-channel sample at half the link rate.
//!
//! # Link health
//!
//! A watchdog thread compares the dropped packet count with a threshold every
//! few seconds and resets the board when it is exceeded. The read loop pauses
//! while that reset is in flight.

mod board;
mod config;
mod decoder;
mod dispatch;
mod errors;
mod link;
pub mod logging;
mod port;
pub mod protocol;
mod sample;
mod watchdog;

#[cfg(feature = "python")]
mod python;

pub use board::{OpenBci, StreamSummary};
pub use config::{
    BoardConfig, DEFAULT_BAUD, DEFAULT_BOOT_DELAY, DEFAULT_MAX_DROPPED, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_INTERVAL, DEFAULT_RECONNECT_PAUSE,
};
pub use decoder::{Decoded, DecoderState, FrameDecoder, RawPacket};
pub use dispatch::{Consumer, StreamDispatcher};
pub use errors::*;
pub use link::{Link, LinkReader, LinkStatus, Transport};
pub use port::{locate_among, PortLocator};
pub use protocol::TestSignal;
pub use sample::{Sample, SampleAssembler};
pub use watchdog::Watchdog;
