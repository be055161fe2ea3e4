//! Byte-level frame synchronization.
//!
//! `FrameDecoder` pulls bytes from any `Read` source and extracts fixed-layout
//! packets. It resynchronizes on the start byte after every complete or aborted
//! packet, so line noise costs at most one packet.

use std::io::{ErrorKind, Read};
use std::mem;

use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::protocol::{
    AUX_PER_PACKET, BYTES_PER_AUX, BYTES_PER_CHANNEL, CHANNELS_PER_PACKET, END_BYTE, START_BYTE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    AwaitingStartByte,
    ReadingChannels,
    ReadingAux,
    AwaitingEndByte,
}

/// One framed packet with its fields still in wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet_id: u8,
    pub channels: Vec<[u8; 3]>,
    pub aux: Vec<[u8; 2]>,
}

/// Outcome of decoding one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Packet(RawPacket),
    /// End byte mismatch; the packet was discarded.
    Malformed { packet_id: u8, end_byte: u8 },
}

#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    channel_count: usize,
    aux_count: usize,
    /// Per-packet read buffer, cleared before each field group is read.
    scratch: Vec<u8>,
    packet_id: u8,
    channels: Vec<[u8; 3]>,
    aux: Vec<[u8; 2]>,
    /// Bytes discarded while hunting for the current start byte.
    skipping: usize,
    skipped_total: u64,
    verbose: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(CHANNELS_PER_PACKET, AUX_PER_PACKET)
    }
}

impl FrameDecoder {
    pub fn new(channel_count: usize, aux_count: usize) -> Self {
        Self {
            state: DecoderState::AwaitingStartByte,
            channel_count,
            aux_count: aux_count.min(AUX_PER_PACKET),
            scratch: Vec::with_capacity(1 + channel_count * BYTES_PER_CHANNEL),
            packet_id: 0,
            channels: Vec::new(),
            aux: Vec::new(),
            skipping: 0,
            skipped_total: 0,
            verbose: false,
        }
    }

    /// Log every resync at debug level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Total bytes discarded while resynchronizing.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_total
    }

    /// Drop any partial packet and wait for the next start byte.
    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitingStartByte;
        self.scratch.clear();
        self.channels.clear();
        self.aux.clear();
        self.skipping = 0;
    }

    /// Read until one packet has been framed (valid or malformed).
    ///
    /// Returns `DeviceStalled` when a read yields no bytes within the source's
    /// timeout. The decoder is reset on any error.
    pub fn next_packet<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Decoded> {
        loop {
            let step = match self.state {
                DecoderState::AwaitingStartByte => self.on_awaiting_start(reader),
                DecoderState::ReadingChannels => self.on_reading_channels(reader),
                DecoderState::ReadingAux => self.on_reading_aux(reader),
                DecoderState::AwaitingEndByte => self.on_awaiting_end(reader),
            };
            match step {
                Ok(Some(decoded)) => return Ok(decoded),
                Ok(None) => {}
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
    }

    fn on_awaiting_start<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Decoded>> {
        let byte = self.read_byte(reader)?;
        if byte != START_BYTE {
            self.skipping += 1;
            self.skipped_total += 1;
            return Ok(None);
        }
        if self.skipping > 0 {
            if self.verbose {
                debug!("skipped {} bytes before start byte", self.skipping);
            }
            self.skipping = 0;
        }
        self.scratch.clear();
        self.state = DecoderState::ReadingChannels;
        Ok(None)
    }

    fn on_reading_channels<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Decoded>> {
        self.fill_scratch(reader, 1 + self.channel_count * BYTES_PER_CHANNEL)?;
        self.packet_id = self.scratch[0];
        self.channels = self.scratch[1..]
            .chunks_exact(BYTES_PER_CHANNEL)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        self.state = DecoderState::ReadingAux;
        Ok(None)
    }

    fn on_reading_aux<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Decoded>> {
        self.fill_scratch(reader, self.aux_count * BYTES_PER_AUX)?;
        self.aux = self
            .scratch
            .chunks_exact(BYTES_PER_AUX)
            .map(|c| [c[0], c[1]])
            .collect();
        self.state = DecoderState::AwaitingEndByte;
        Ok(None)
    }

    fn on_awaiting_end<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Decoded>> {
        let byte = self.read_byte(reader)?;
        self.state = DecoderState::AwaitingStartByte;

        if byte == END_BYTE {
            return Ok(Some(Decoded::Packet(RawPacket {
                packet_id: self.packet_id,
                channels: mem::take(&mut self.channels),
                aux: mem::take(&mut self.aux),
            })));
        }

        warn!(
            "malformed packet: id={} end byte {:#04X} (expected {:#04X}), discarding",
            self.packet_id, byte, END_BYTE
        );
        self.channels.clear();
        self.aux.clear();
        Ok(Some(Decoded::Malformed {
            packet_id: self.packet_id,
            end_byte: byte,
        }))
    }

    fn read_byte<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<u8> {
        let mut byte = [0u8; 1];
        read_full(reader, &mut byte)?;
        Ok(byte[0])
    }

    fn fill_scratch<R: Read + ?Sized>(&mut self, reader: &mut R, len: usize) -> Result<()> {
        self.scratch.clear();
        self.scratch.resize(len, 0);
        read_full(reader, &mut self.scratch)
    }
}

/// Fill `buf` completely. A read that times out or returns zero bytes is a stall.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(DriverError::DeviceStalled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(DriverError::DeviceStalled)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
