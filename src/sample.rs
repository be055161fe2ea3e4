//! Scaled samples and daisy packet fusion.

use log::{debug, warn};

use crate::decoder::RawPacket;
use crate::protocol::{
    interpret_16bit_as_i16, interpret_24bit_as_i32, CHANNELS_PER_PACKET, SCALE_G_PER_COUNT,
    SCALE_UV_PER_COUNT,
};

/// One delivered reading.
///
/// `channel_data` holds 8 values, or 16 when daisy fusion is active (main board
/// channels first). Values are microvolts and g when scaling is enabled,
/// raw counts otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Packet counter (0-255, wrapping). Always even in daisy mode.
    pub packet_id: u8,
    pub channel_data: Vec<f64>,
    pub aux_data: Vec<f64>,
}

impl Sample {
    pub fn new(packet_id: u8, channel_data: Vec<f64>, aux_data: Vec<f64>) -> Self {
        Self {
            packet_id,
            channel_data,
            aux_data,
        }
    }
}

/// Odd-id half of a daisy sample, waiting for its even partner.
#[derive(Debug, Clone)]
struct PendingOddSample {
    packet_id: u8,
    channel_data: Vec<f64>,
    aux_data: Vec<f64>,
}

/// Turns framed packets into samples.
#[derive(Debug)]
pub struct SampleAssembler {
    daisy: bool,
    scaling: bool,
    pending: Option<PendingOddSample>,
    pairing_gaps: u64,
}

impl SampleAssembler {
    pub fn new(daisy: bool, scaling: bool) -> Self {
        Self {
            daisy,
            scaling,
            pending: None,
            pairing_gaps: 0,
        }
    }

    /// Channels per delivered sample.
    pub fn channel_count(&self) -> usize {
        if self.daisy {
            CHANNELS_PER_PACKET * 2
        } else {
            CHANNELS_PER_PACKET
        }
    }

    /// Half-samples discarded because their daisy partner never arrived.
    pub fn pairing_gaps(&self) -> u64 {
        self.pairing_gaps
    }

    /// Forget any cached half-sample.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed one packet. Returns a sample when one is ready for delivery.
    pub fn push(&mut self, packet: RawPacket) -> Option<Sample> {
        let (channel_data, aux_data) = self.scale(&packet);
        if !self.daisy {
            return Some(Sample::new(packet.packet_id, channel_data, aux_data));
        }

        let id = packet.packet_id;
        if id % 2 == 1 {
            let half = PendingOddSample {
                packet_id: id,
                channel_data,
                aux_data,
            };
            if let Some(stale) = self.pending.replace(half) {
                self.pairing_gaps += 1;
                warn!(
                    "daisy pairing gap: odd packet {} replaced by odd packet {}, sample dropped",
                    stale.packet_id, id
                );
            }
            return None;
        }

        match self.pending.take() {
            Some(odd) if odd.packet_id == id.wrapping_sub(1) => {
                Some(fuse(id, odd, channel_data, &aux_data))
            }
            Some(odd) => {
                self.pairing_gaps += 1;
                warn!(
                    "daisy pairing gap: even packet {} does not follow odd packet {}, sample dropped",
                    id, odd.packet_id
                );
                None
            }
            None => {
                self.pairing_gaps += 1;
                debug!("even packet {} without a cached odd half, dropped", id);
                None
            }
        }
    }

    fn scale(&self, packet: &RawPacket) -> (Vec<f64>, Vec<f64>) {
        let (uv, g) = if self.scaling {
            (SCALE_UV_PER_COUNT, SCALE_G_PER_COUNT)
        } else {
            (1.0, 1.0)
        };
        let channels = packet
            .channels
            .iter()
            .map(|&raw| f64::from(interpret_24bit_as_i32(raw)) * uv)
            .collect();
        let aux = packet
            .aux
            .iter()
            .map(|&raw| f64::from(interpret_16bit_as_i16(raw)) * g)
            .collect();
        (channels, aux)
    }
}

/// Odd-board channels first, then the even packet's; aux averaged.
fn fuse(id: u8, odd: PendingOddSample, even_channels: Vec<f64>, even_aux: &[f64]) -> Sample {
    let mut channel_data = odd.channel_data;
    channel_data.extend(even_channels);
    let aux_data = odd
        .aux_data
        .iter()
        .zip(even_aux)
        .map(|(a, b)| (a + b) / 2.0)
        .collect();
    Sample::new(id, channel_data, aux_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u8, channels: [i32; 8], aux: [i16; 3]) -> RawPacket {
        RawPacket {
            packet_id: id,
            channels: channels
                .iter()
                .map(|v| {
                    let b = v.to_be_bytes();
                    [b[1], b[2], b[3]]
                })
                .collect(),
            aux: aux.iter().map(|v| v.to_be_bytes()).collect(),
        }
    }

    #[test]
    fn test_scaling_edges() {
        let mut asm = SampleAssembler::new(false, true);
        let pkt = RawPacket {
            packet_id: 0,
            channels: vec![
                [0x00, 0x00, 0x00],
                [0x7F, 0xFF, 0xFF],
                [0xFF, 0xFF, 0xFF],
                [0x80, 0x00, 0x00],
                [0, 0, 0],
                [0, 0, 0],
                [0, 0, 0],
                [0, 0, 0],
            ],
            aux: vec![[0x00, 0x10], [0xFF, 0xF0], [0, 0]],
        };
        let s = asm.push(pkt).unwrap();

        assert_eq!(s.channel_data[0], 0.0);
        assert!((s.channel_data[1] - 8_388_607.0 * SCALE_UV_PER_COUNT).abs() < 1e-9);
        assert!(s.channel_data.iter().all(|v| *v <= s.channel_data[1]));
        assert!(s.channel_data[2] < 0.0);
        assert!(s.channel_data[2].abs() <= SCALE_UV_PER_COUNT + 1e-12);
        assert!((s.channel_data[3] + 187_500.0).abs() < 1e-6);
        assert!((s.aux_data[0] - 0.002).abs() < 1e-12);
        assert!((s.aux_data[1] + 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_scaling_disabled_delivers_counts() {
        let mut asm = SampleAssembler::new(false, false);
        let s = asm
            .push(raw(5, [1, -1, 100, 0, 0, 0, 0, 8_388_607], [16, -16, 0]))
            .unwrap();
        assert_eq!(s.packet_id, 5);
        assert_eq!(s.channel_data[..3], [1.0, -1.0, 100.0]);
        assert_eq!(s.channel_data[7], 8_388_607.0);
        assert_eq!(s.aux_data, vec![16.0, -16.0, 0.0]);
    }

    #[test]
    fn test_daisy_fusion() {
        let mut asm = SampleAssembler::new(true, false);
        assert_eq!(asm.channel_count(), 16);

        let odd = raw(1, [1, 2, 3, 4, 5, 6, 7, 8], [10, 20, 30]);
        let even = raw(2, [11, 12, 13, 14, 15, 16, 17, 18], [30, 40, 51]);

        assert!(asm.push(odd).is_none());
        let s = asm.push(even).unwrap();
        assert_eq!(s.packet_id, 2);
        assert_eq!(s.channel_data.len(), 16);
        assert_eq!(
            s.channel_data,
            (1..=8).chain(11..=18).map(f64::from).collect::<Vec<_>>()
        );
        assert_eq!(s.aux_data, vec![20.0, 30.0, 40.5]);
        assert_eq!(asm.pairing_gaps(), 0);
    }

    #[test]
    fn test_daisy_back_to_back_odd_replaces_cache() {
        let mut asm = SampleAssembler::new(true, false);
        assert!(asm.push(raw(1, [1; 8], [0; 3])).is_none());
        assert!(asm.push(raw(3, [3; 8], [0; 3])).is_none());
        assert_eq!(asm.pairing_gaps(), 1);

        let s = asm.push(raw(4, [4; 8], [0; 3])).unwrap();
        assert_eq!(s.channel_data[..8], [3.0; 8]);
        assert_eq!(s.channel_data[8..], [4.0; 8]);
    }

    #[test]
    fn test_daisy_unpaired_even_is_dropped() {
        let mut asm = SampleAssembler::new(true, false);
        assert!(asm.push(raw(2, [0; 8], [0; 3])).is_none());
        assert!(asm.push(raw(5, [0; 8], [0; 3])).is_none());
        assert!(asm.push(raw(8, [0; 8], [0; 3])).is_none());
        assert_eq!(asm.pairing_gaps(), 2);
    }

    #[test]
    fn test_daisy_pairs_across_id_wrap() {
        let mut asm = SampleAssembler::new(true, false);
        assert!(asm.push(raw(255, [1; 8], [0; 3])).is_none());
        let s = asm.push(raw(0, [2; 8], [0; 3])).unwrap();
        assert_eq!(s.packet_id, 0);
        assert_eq!(s.channel_data.len(), 16);
    }

    #[test]
    fn test_reset_clears_pending_half() {
        let mut asm = SampleAssembler::new(true, false);
        assert!(asm.push(raw(1, [0; 8], [0; 3])).is_none());
        asm.reset();
        assert!(asm.push(raw(2, [0; 8], [0; 3])).is_none());
    }
}
