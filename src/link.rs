//! Serial link lifecycle.
//!
//! `Link` owns the serial handle and the shared `LinkState`. It is cheap to
//! clone: the read loop, the watchdog and user code all hold handles to the
//! same port. The read loop writes `packets_dropped`; `start`/`stop`/
//! `reconnect` write `streaming`; everything else only reads.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::BoardConfig;
use crate::errors::{DriverError, Result};
use crate::port::PortLocator;
use crate::protocol::{
    channel_command, TestSignal, BANNER_TERMINATOR, CHANNELS_PER_PACKET, CMD_FILTERS_OFF,
    CMD_FILTERS_ON, CMD_SOFT_RESET, CMD_START_STREAM, CMD_STOP_STREAM, DAISY_MARKER,
    DEVICE_ID_MARKER,
};

/// Upper bound on banner text kept while waiting for the terminator
const MAX_BANNER_LEN: usize = 4096;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

type SharedTransport = Arc<Mutex<Option<Box<dyn Transport>>>>;

// ============================================================================
// Link State
// ============================================================================

#[derive(Debug, Default)]
pub struct LinkState {
    connected: AtomicBool,
    streaming: AtomicBool,
    reconnecting: AtomicBool,
    packets_dropped: AtomicU32,
    reconnects: AtomicU32,
    last_reconnect: Mutex<Option<Instant>>,
    /// Error of the last reconnect attempt, until the read loop collects it.
    reconnect_failure: Mutex<Option<String>>,
}

/// Point-in-time copy of `LinkState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub streaming: bool,
    pub reconnecting: bool,
    /// Packets dropped since open or the last reconnect.
    pub packets_dropped: u32,
    pub reconnects: u32,
    pub last_reconnect_time: Option<Instant>,
}

/// Clears the reconnect flag when a reconnect finishes, successfully or not.
struct ReconnectGuard<'a>(&'a LinkState);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.reconnecting.store(false, Ordering::Release);
    }
}

// ============================================================================
// Link
// ============================================================================

#[derive(Clone)]
pub struct Link {
    transport: SharedTransport,
    state: Arc<LinkState>,
    config: Arc<BoardConfig>,
}

impl Link {
    /// Open the configured port (or locate one), boot the board and read its banner.
    pub fn open(config: BoardConfig) -> Result<Self> {
        config.validate()?;
        let port = match &config.port {
            Some(port) => port.clone(),
            None => PortLocator::from_config(&config).locate()?,
        };

        let serial = serialport::new(&port, config.baud)
            .timeout(config.read_timeout)
            .open()?;
        info!("opened serial port {} at {} baud", port, config.baud);

        let config = BoardConfig {
            port: Some(port),
            ..config
        };
        Self::with_transport(Box::new(serial), config)
    }

    /// Bring up a link over an already-open transport.
    pub fn with_transport(mut transport: Box<dyn Transport>, config: BoardConfig) -> Result<Self> {
        config.validate()?;

        // the board ignores commands while it boots
        thread::sleep(config.boot_delay);
        write_command(transport.as_mut(), CMD_SOFT_RESET)?;

        let banner = read_banner(transport.as_mut(), config.read_timeout)?;
        for line in banner.lines().filter(|l| !l.trim().is_empty()) {
            debug!("board: {}", line.trim());
        }
        if !banner.contains(DEVICE_ID_MARKER) {
            warn!("boot banner does not identify an OpenBCI board");
        }

        let detected_daisy = banner_reports_daisy(&banner);
        if detected_daisy && !config.daisy {
            info!("daisy module detected, enabling 16-channel mode");
        }
        let config = BoardConfig {
            daisy: config.daisy || detected_daisy,
            ..config
        };

        let filter_cmd = if config.filtering {
            CMD_FILTERS_ON
        } else {
            CMD_FILTERS_OFF
        };
        write_command(transport.as_mut(), filter_cmd)?;

        let state = LinkState::default();
        state.connected.store(true, Ordering::Release);

        Ok(Self {
            transport: Arc::new(Mutex::new(Some(transport))),
            state: Arc::new(state),
            config: Arc::new(config),
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn start(&self) -> Result<()> {
        self.send_command(CMD_START_STREAM)?;
        self.state.streaming.store(true, Ordering::Release);
        if self.config.logging {
            info!("streaming started");
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.state.streaming.store(false, Ordering::Release);
        self.send_command(CMD_STOP_STREAM)?;
        if self.config.logging {
            info!("streaming stopped");
        }
        Ok(())
    }

    /// Stop streaming and close the handle. Safe to call repeatedly.
    pub fn disconnect(&self) -> Result<()> {
        if !self.state.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.streaming.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.send_command(CMD_STOP_STREAM) {
                warn!("failed to stop stream while disconnecting: {}", e);
            }
        }
        let closed = self.lock_transport()?.take();
        drop(closed);
        info!("link closed");
        Ok(())
    }

    /// Stop, soft-reset and restart the stream on the same port.
    ///
    /// Returns `Ok(false)` without touching the link when another reconnect is
    /// already in flight.
    pub fn reconnect(&self) -> Result<bool> {
        if self
            .state
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reconnect already in progress");
            return Ok(false);
        }
        let _guard = ReconnectGuard(&self.state);

        info!("reconnecting");
        // recorded before the guard clears `reconnecting`
        let outcome = self.restart_stream();
        if let Ok(mut failure) = self.state.reconnect_failure.lock() {
            *failure = outcome.as_ref().err().map(ToString::to_string);
        }
        outcome?;

        self.state.packets_dropped.store(0, Ordering::Release);
        self.state.reconnects.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut last) = self.state.last_reconnect.lock() {
            *last = Some(Instant::now());
        }
        Ok(true)
    }

    fn restart_stream(&self) -> Result<()> {
        let pause = self.config.reconnect_pause;
        self.stop()?;
        thread::sleep(pause);
        self.send_command(CMD_SOFT_RESET)?;
        thread::sleep(pause);
        self.start()
    }

    // ------------------------------------------------------------------------
    // Board Commands
    // ------------------------------------------------------------------------

    pub fn enable_filters(&self) -> Result<()> {
        self.send_command(CMD_FILTERS_ON)
    }

    pub fn disable_filters(&self) -> Result<()> {
        self.send_command(CMD_FILTERS_OFF)
    }

    /// Switch a 1-based channel on or off. Channels 9-16 need a daisy module.
    pub fn set_channel(&self, channel: u8, on: bool) -> Result<()> {
        let cmd = channel_command(channel, on, self.channel_count())?;
        self.send_command(cmd)
    }

    pub fn test_signal(&self, signal: TestSignal) -> Result<()> {
        debug!("selecting test signal {:?}", signal);
        self.send_command(signal.command())
    }

    /// Write a single control byte.
    pub fn send_command(&self, cmd: u8) -> Result<()> {
        let mut guard = self.lock_transport()?;
        let transport = guard.as_mut().ok_or(DriverError::NotConnected)?;
        write_command(transport.as_mut(), cmd)
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn port_name(&self) -> Option<&str> {
        self.config.port.as_deref()
    }

    pub fn daisy(&self) -> bool {
        self.config.daisy
    }

    /// EEG channels per delivered sample.
    pub fn channel_count(&self) -> usize {
        if self.config.daisy {
            CHANNELS_PER_PACKET * 2
        } else {
            CHANNELS_PER_PACKET
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::Acquire)
    }

    pub fn packets_dropped(&self) -> u32 {
        self.state.packets_dropped.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.is_connected(),
            streaming: self.is_streaming(),
            reconnecting: self.is_reconnecting(),
            packets_dropped: self.packets_dropped(),
            reconnects: self.state.reconnects.load(Ordering::Acquire),
            last_reconnect_time: self.state.last_reconnect.lock().ok().and_then(|t| *t),
        }
    }

    /// Count one dropped packet; returns the new total.
    pub(crate) fn record_dropped(&self) -> u32 {
        self.state.packets_dropped.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take the error left by a reconnect that failed since the last call.
    pub(crate) fn take_reconnect_failure(&self) -> Option<DriverError> {
        self.state
            .reconnect_failure
            .lock()
            .ok()
            .and_then(|mut failure| failure.take())
            .map(DriverError::ReconnectFailed)
    }

    /// The device went silent; streaming is over without a stop command.
    pub(crate) fn mark_stalled(&self) {
        self.state.streaming.store(false, Ordering::Release);
    }

    /// Byte source for the read loop. Each read holds the handle only for its duration.
    pub fn reader(&self) -> LinkReader {
        LinkReader {
            transport: Arc::clone(&self.transport),
        }
    }

    fn lock_transport(&self) -> Result<MutexGuard<'_, Option<Box<dyn Transport>>>> {
        self.transport
            .lock()
            .map_err(|_| DriverError::Io(io::Error::other("serial handle lock poisoned")))
    }
}

/// `Read` adapter over the shared handle.
pub struct LinkReader {
    transport: SharedTransport,
}

impl Read for LinkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self
            .transport
            .lock()
            .map_err(|_| io::Error::other("serial handle lock poisoned"))?;
        match guard.as_mut() {
            Some(transport) => transport.read(buf),
            None => Err(io::Error::new(ErrorKind::NotConnected, "link closed")),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn write_command<T: Write + ?Sized>(transport: &mut T, cmd: u8) -> Result<()> {
    transport.write_all(&[cmd])?;
    transport.flush()?;
    Ok(())
}

/// Read banner text up to the `$$$` terminator, a silent read or `timeout`.
pub(crate) fn read_banner<R: Read + ?Sized>(reader: &mut R, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut text = Vec::with_capacity(256);
    let mut terminated = false;

    while text.len() < MAX_BANNER_LEN && Instant::now() < deadline {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                text.push(byte[0]);
                if text.ends_with(BANNER_TERMINATOR) {
                    text.truncate(text.len() - BANNER_TERMINATOR.len());
                    terminated = true;
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if !terminated {
        debug!("banner ended without terminator after {} bytes", text.len());
    }
    Ok(String::from_utf8_lossy(&text).into_owned())
}

pub(crate) fn banner_reports_daisy(banner: &str) -> bool {
    banner.to_lowercase().contains(DAISY_MARKER)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) const BANNER: &[u8] =
        b"OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\nLIS3DH Device ID: 0x33\nFirmware: v3.1.2\n$$$";
    pub(crate) const DAISY_BANNER: &[u8] =
        b"OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\nOn Daisy ADS1299 Device ID: 0x3E\n$$$";

    /// In-memory transport: scripted input, recorded output.
    pub(crate) struct MockTransport {
        input: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl MockTransport {
        pub(crate) fn new(input: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    input: Cursor::new(input),
                    written: Arc::clone(&written),
                },
                written,
            )
        }
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn fast_config() -> BoardConfig {
        BoardConfig {
            port: Some("mock".into()),
            read_timeout: Duration::from_millis(200),
            boot_delay: Duration::ZERO,
            reconnect_pause: Duration::ZERO,
            watchdog: false,
            ..BoardConfig::default()
        }
    }

    impl Link {
        pub(crate) fn force_streaming(&self, on: bool) {
            self.state.streaming.store(on, Ordering::Release);
        }

        pub(crate) fn force_reconnecting(&self, on: bool) {
            self.state.reconnecting.store(on, Ordering::Release);
        }
    }

    fn open_mock(input: &[u8], config: BoardConfig) -> (Link, Arc<Mutex<Vec<u8>>>) {
        let (mock, written) = MockTransport::new(input.to_vec());
        let link = Link::with_transport(Box::new(mock), config).unwrap();
        (link, written)
    }

    #[test]
    fn test_open_resets_and_reads_banner() {
        let (link, written) = open_mock(BANNER, fast_config());
        assert_eq!(written.lock().unwrap().as_slice(), b"?f");
        assert!(link.is_connected());
        assert!(!link.is_streaming());
        assert!(!link.daisy());
        assert_eq!(link.channel_count(), 8);
    }

    #[test]
    fn test_open_detects_daisy_from_banner() {
        let (link, _) = open_mock(DAISY_BANNER, fast_config());
        assert!(link.daisy());
        assert_eq!(link.channel_count(), 16);
    }

    #[test]
    fn test_open_honors_daisy_flag_without_banner_hint() {
        let config = BoardConfig {
            daisy: true,
            filtering: false,
            ..fast_config()
        };
        let (link, written) = open_mock(b"", config);
        assert!(link.daisy());
        assert_eq!(written.lock().unwrap().as_slice(), b"?g");
    }

    #[test]
    fn test_banner_stops_at_terminator() {
        let mut input = BANNER.to_vec();
        input.extend_from_slice(&[0xA0, 0x01]);
        let mut cursor = Cursor::new(input);

        let banner = read_banner(&mut cursor, Duration::from_secs(1)).unwrap();
        assert!(banner.starts_with("OpenBCI"));
        assert!(!banner.contains("$$$"));
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![0xA0, 0x01]);
    }

    #[test]
    fn test_start_stop_toggle_streaming() {
        let (link, written) = open_mock(BANNER, fast_config());
        link.start().unwrap();
        assert!(link.is_streaming());
        link.stop().unwrap();
        assert!(!link.is_streaming());
        assert_eq!(written.lock().unwrap().as_slice(), b"?fbs");
    }

    #[test]
    fn test_reconnect_resets_drop_counter() {
        let (link, written) = open_mock(BANNER, fast_config());
        link.start().unwrap();
        for _ in 0..5 {
            link.record_dropped();
        }
        assert_eq!(link.packets_dropped(), 5);

        assert!(link.reconnect().unwrap());
        let status = link.status();
        assert_eq!(status.packets_dropped, 0);
        assert!(status.streaming);
        assert!(!status.reconnecting);
        assert_eq!(status.reconnects, 1);
        assert!(status.last_reconnect_time.is_some());
        assert_eq!(written.lock().unwrap().as_slice(), b"?fbs?b");
        assert_eq!(link.port_name(), Some("mock"));
    }

    #[test]
    fn test_reconnect_is_single_flight() {
        let (link, written) = open_mock(BANNER, fast_config());
        link.state.reconnecting.store(true, Ordering::Release);

        assert!(!link.reconnect().unwrap());
        assert_eq!(written.lock().unwrap().as_slice(), b"?f");
        assert!(link.is_reconnecting());
    }

    #[test]
    fn test_failed_reconnect_is_recorded_once() {
        let (link, _) = open_mock(BANNER, fast_config());
        link.start().unwrap();
        link.disconnect().unwrap();

        assert!(matches!(link.reconnect(), Err(DriverError::NotConnected)));
        assert!(!link.is_reconnecting());
        assert!(!link.is_streaming());
        match link.take_reconnect_failure() {
            Some(DriverError::ReconnectFailed(msg)) => assert!(msg.contains("not connected")),
            other => panic!("expected a recorded failure, got {other:?}"),
        }
        assert!(link.take_reconnect_failure().is_none());
    }

    #[test]
    fn test_successful_reconnect_clears_failure() {
        let (link, _) = open_mock(BANNER, fast_config());
        link.start().unwrap();
        *link.state.reconnect_failure.lock().unwrap() = Some("earlier".into());

        assert!(link.reconnect().unwrap());
        assert!(link.take_reconnect_failure().is_none());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (link, written) = open_mock(BANNER, fast_config());
        link.start().unwrap();

        link.disconnect().unwrap();
        link.disconnect().unwrap();
        assert!(!link.is_connected());
        assert!(!link.is_streaming());
        assert_eq!(written.lock().unwrap().as_slice(), b"?fbs");
        assert!(matches!(link.start(), Err(DriverError::NotConnected)));

        let mut reader = link.reader();
        let err = reader.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_channel_and_signal_commands() {
        let (link, written) = open_mock(BANNER, fast_config());
        link.set_channel(3, false).unwrap();
        link.set_channel(3, true).unwrap();
        assert!(link.set_channel(9, true).is_err());
        link.test_signal(TestSignal::Pulse2xFast).unwrap();
        link.disable_filters().unwrap();
        assert_eq!(written.lock().unwrap().as_slice(), b"?f3#]g");
    }

    #[test]
    fn test_daisy_marker_is_case_insensitive() {
        assert!(banner_reports_daisy("On DAISY ADS1299"));
        assert!(!banner_reports_daisy("OpenBCI V3 8 channel"));
    }
}
