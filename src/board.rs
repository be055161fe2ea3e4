//! OpenBCI board driver.
//!
//! `OpenBci` ties the link, frame decoder, sample assembler and watchdog
//! together and runs the read loop on the caller's thread.
//!
//! # Read loop
//!
//! The loop checks `streaming` once per packet. When a reconnect is in flight
//! it pauses and drops any partial packet or cached daisy half; when streaming
//! is off for any other reason it returns. A read that times out with no bytes
//! while streaming ends the loop with `DeviceStalled`; a reconnect that fails
//! ends it with `ReconnectFailed`.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::config::BoardConfig;
use crate::decoder::{Decoded, FrameDecoder};
use crate::dispatch::StreamDispatcher;
use crate::errors::{DriverError, Result};
use crate::link::{Link, LinkStatus, Transport};
use crate::protocol::{TestSignal, AUX_PER_PACKET, SAMPLE_RATE_HZ};
use crate::sample::SampleAssembler;
use crate::watchdog::Watchdog;

/// How often a paused read loop checks whether the reconnect finished
const RECONNECT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Read,
    Pause,
    Exit,
}

/// Counters for one `start_streaming` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub samples_delivered: u64,
    /// Packets discarded for a bad end byte.
    pub packets_malformed: u64,
    /// Daisy half-samples discarded without a partner.
    pub pairing_gaps: u64,
    /// Bytes discarded while looking for a start byte.
    pub bytes_skipped: u64,
    pub elapsed: Duration,
}

/// OpenBCI board driver.
///
/// # Example
/// ```ignore
/// let mut board = OpenBci::open(BoardConfig::with_port("/dev/ttyUSB0"))?;
/// let mut dispatcher = StreamDispatcher::single(|s: &Sample| println!("{:?}", s.channel_data));
/// board.start_streaming(&mut dispatcher, Some(Duration::from_secs(10)))?;
/// board.disconnect()?;
/// ```
pub struct OpenBci {
    link: Link,
    decoder: FrameDecoder,
    assembler: SampleAssembler,
    watchdog: Option<Watchdog>,
    verbose: bool,
}

impl OpenBci {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the board on the configured port, or the first port that identifies as one.
    pub fn open(config: BoardConfig) -> Result<Self> {
        Ok(Self::from_link(Link::open(config)?))
    }

    /// Open over an existing transport (e.g. a socket bridge or a test double).
    pub fn with_transport(transport: Box<dyn Transport>, config: BoardConfig) -> Result<Self> {
        Ok(Self::from_link(Link::with_transport(transport, config)?))
    }

    pub fn from_link(link: Link) -> Self {
        let config = link.config();
        let verbose = config.logging;
        let decoder = FrameDecoder::default().verbose(verbose);
        let assembler = SampleAssembler::new(link.daisy(), config.scaling);
        Self {
            link,
            decoder,
            assembler,
            watchdog: None,
            verbose,
        }
    }

    // ------------------------------------------------------------------------
    // Board Info
    // ------------------------------------------------------------------------

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    /// Delivered samples per second; daisy fusion halves the raw link rate.
    pub fn sample_rate(&self) -> f64 {
        if self.link.daisy() {
            SAMPLE_RATE_HZ / 2.0
        } else {
            SAMPLE_RATE_HZ
        }
    }

    pub fn eeg_channel_count(&self) -> usize {
        self.assembler.channel_count()
    }

    pub fn aux_channel_count(&self) -> usize {
        AUX_PER_PACKET
    }

    pub fn packets_dropped(&self) -> u32 {
        self.link.packets_dropped()
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Start the stream and deliver samples until it stops.
    ///
    /// Returns when `lapse` has elapsed (the stream is stopped), when streaming
    /// is switched off from another handle, or with an error when the device
    /// stalls or the link fails.
    pub fn start_streaming(
        &mut self,
        dispatcher: &mut StreamDispatcher<'_>,
        lapse: Option<Duration>,
    ) -> Result<StreamSummary> {
        if let Some(stale) = self.link.take_reconnect_failure() {
            debug!("discarding earlier {}", stale);
        }
        if !self.link.is_streaming() {
            self.link.start()?;
        }
        self.decoder.reset();
        self.assembler.reset();

        let config = self.link.config();
        if config.watchdog {
            self.watchdog = Some(Watchdog::spawn(
                self.link.clone(),
                config.reconnect_interval,
                config.max_dropped_before_reconnect,
            )?);
        }
        if self.verbose {
            info!(
                "streaming {} channels to {} consumers",
                self.eeg_channel_count(),
                dispatcher.len()
            );
        }

        let result = self.read_loop(dispatcher, lapse);

        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        result
    }

    fn read_loop(
        &mut self,
        dispatcher: &mut StreamDispatcher<'_>,
        lapse: Option<Duration>,
    ) -> Result<StreamSummary> {
        let started = Instant::now();
        let delivered_before = dispatcher.delivered();
        let gaps_before = self.assembler.pairing_gaps();
        let skipped_before = self.decoder.skipped_bytes();
        let mut malformed = 0u64;
        // read error swallowed while stopping or reconnecting
        let mut deferred: Option<DriverError> = None;
        let mut reader = self.link.reader();

        loop {
            match self.gate() {
                Gate::Read => {}
                Gate::Pause => {
                    self.decoder.reset();
                    self.assembler.reset();
                    thread::sleep(RECONNECT_POLL);
                    continue;
                }
                Gate::Exit => {
                    if let Some(e) = self.link.take_reconnect_failure() {
                        error!("stream ended by a failed reconnect: {}", e);
                        return Err(e);
                    }
                    if let Some(e) = deferred.take() {
                        error!("stream ended after a read failure: {}", e);
                        return Err(e);
                    }
                    break;
                }
            }

            match self.decoder.next_packet(&mut reader) {
                Ok(Decoded::Packet(packet)) => {
                    deferred = None;
                    if let Some(sample) = self.assembler.push(packet) {
                        if self.verbose {
                            debug!("sample id={} channels={:?}", sample.packet_id, sample.channel_data);
                        }
                        dispatcher.dispatch(&sample);
                    }
                }
                Ok(Decoded::Malformed { .. }) => {
                    malformed += 1;
                    let dropped = self.link.record_dropped();
                    debug!("packets dropped since last reconnect: {}", dropped);
                }
                // stopped or reconnecting underneath the read; the gate decides
                Err(e) if !self.link.is_streaming() || self.link.is_reconnecting() => {
                    if !matches!(e, DriverError::DeviceStalled) {
                        deferred = Some(e);
                    }
                    continue;
                }
                Err(DriverError::DeviceStalled) => {
                    self.link.mark_stalled();
                    error!("device appears to be stalled, stopping stream");
                    return Err(DriverError::DeviceStalled);
                }
                Err(e) => {
                    self.link.mark_stalled();
                    error!("read failed, stopping stream: {}", e);
                    return Err(e);
                }
            }

            if lapse.is_some_and(|lapse| started.elapsed() >= lapse) {
                self.link.stop()?;
                break;
            }
        }

        let summary = StreamSummary {
            samples_delivered: dispatcher.delivered() - delivered_before,
            packets_malformed: malformed,
            pairing_gaps: self.assembler.pairing_gaps() - gaps_before,
            bytes_skipped: self.decoder.skipped_bytes() - skipped_before,
            elapsed: started.elapsed(),
        };
        if self.verbose {
            info!("stream ended: {:?}", summary);
        }
        Ok(summary)
    }

    /// Whether the read loop should read, wait out a reconnect, or leave.
    fn gate(&self) -> Gate {
        if self.link.is_streaming() {
            return Gate::Read;
        }
        if self.link.is_reconnecting() {
            return Gate::Pause;
        }
        // a reconnect may have restarted the stream between the two loads
        if self.link.is_streaming() {
            return Gate::Read;
        }
        Gate::Exit
    }

    // ------------------------------------------------------------------------
    // Link Control
    // ------------------------------------------------------------------------

    pub fn stop(&self) -> Result<()> {
        self.link.stop()
    }

    pub fn reconnect(&self) -> Result<bool> {
        self.link.reconnect()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.link.disconnect()
    }

    pub fn enable_filters(&self) -> Result<()> {
        self.link.enable_filters()
    }

    pub fn disable_filters(&self) -> Result<()> {
        self.link.disable_filters()
    }

    pub fn set_channel(&self, channel: u8, on: bool) -> Result<()> {
        self.link.set_channel(channel, on)
    }

    pub fn test_signal(&self, signal: TestSignal) -> Result<()> {
        self.link.test_signal(signal)
    }
}

impl Drop for OpenBci {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("disconnect on drop failed: {}", e);
        }
    }
}
