//! Incremental MT frame decoder
//!
//! Resynchronises on the SOF marker after garbage, bad lengths or FCS
//! failures, so a corrupted frame never poisons the frames around it.

use crate::frame::{checksum, MtFrame, MAX_PAYLOAD, SOF};
use crate::types::{CommandType, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    SeekSof,
    ReadLen,
    ReadCmd0,
    ReadCmd1,
    ReadData,
    ReadFcs,
}

/// Running counters kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Complete frames emitted
    pub frames: u64,
    /// Frames dropped for bad FCS, bad length or a reserved frame type
    pub framing_errors: u64,
    /// Bytes discarded while hunting for SOF
    pub bytes_skipped: u64,
}

/// Streaming decoder for MT frames
pub struct FrameDecoder {
    state: DecoderState,
    len: usize,
    cmd0: u8,
    cmd1: u8,
    data: Vec<u8>,
    stats: DecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecoderState::SeekSof,
            len: 0,
            cmd0: 0,
            cmd1: 0,
            data: Vec::with_capacity(MAX_PAYLOAD),
            stats: DecoderStats::default(),
        }
    }

    /// Feed bytes into the decoder and extract complete frames
    ///
    /// Returns the frames completed by this chunk (may be empty). Feeding
    /// one byte at a time yields the same frame sequence as feeding the
    /// whole stream at once.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MtFrame> {
        let mut frames = Vec::new();

        for &byte in bytes {
            match self.state {
                DecoderState::SeekSof => {
                    if byte == SOF {
                        self.state = DecoderState::ReadLen;
                    } else {
                        self.stats.bytes_skipped += 1;
                    }
                }
                DecoderState::ReadLen => {
                    if byte as usize > MAX_PAYLOAD {
                        tracing::debug!("Rejecting frame with length {}", byte);
                        self.stats.framing_errors += 1;
                        self.state = DecoderState::SeekSof;
                    } else {
                        self.len = byte as usize;
                        self.state = DecoderState::ReadCmd0;
                    }
                }
                DecoderState::ReadCmd0 => {
                    self.cmd0 = byte;
                    self.state = DecoderState::ReadCmd1;
                }
                DecoderState::ReadCmd1 => {
                    self.cmd1 = byte;
                    self.data.clear();
                    self.state = if self.len == 0 {
                        DecoderState::ReadFcs
                    } else {
                        DecoderState::ReadData
                    };
                }
                DecoderState::ReadData => {
                    self.data.push(byte);
                    if self.data.len() == self.len {
                        self.state = DecoderState::ReadFcs;
                    }
                }
                DecoderState::ReadFcs => {
                    self.state = DecoderState::SeekSof;
                    if let Some(frame) = self.finish(byte) {
                        frames.push(frame);
                    }
                }
            }
        }

        frames
    }

    /// Validate FCS and frame type once all bytes of a frame are in
    fn finish(&mut self, fcs: u8) -> Option<MtFrame> {
        let mut expected = (self.len as u8) ^ self.cmd0 ^ self.cmd1;
        expected ^= checksum(&self.data);

        if expected != fcs {
            tracing::debug!(
                "Dropping frame with bad FCS: expected {:#04x}, got {:#04x}",
                expected,
                fcs
            );
            self.stats.framing_errors += 1;
            return None;
        }

        let Some(cmd_type) = CommandType::from_bits(self.cmd0 >> 5) else {
            tracing::debug!("Dropping frame with reserved type bits in CMD0 {:#04x}", self.cmd0);
            self.stats.framing_errors += 1;
            return None;
        };

        self.stats.frames += 1;
        Some(MtFrame {
            subsystem: Subsystem::from_bits(self.cmd0 & 0x1F),
            cmd_type,
            id: self.cmd1,
            payload: std::mem::take(&mut self.data),
        })
    }

    #[must_use]
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partial frame and hunt for the next SOF
    pub fn reset(&mut self) {
        self.state = DecoderState::SeekSof;
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_rsp() -> MtFrame {
        MtFrame::new(Subsystem::Sys, CommandType::Srsp, 0x01, vec![0x59, 0x06])
    }

    fn incoming_msg() -> MtFrame {
        MtFrame::new(Subsystem::Af, CommandType::Areq, 0x81, vec![0xAA; 10])
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&ping_rsp().serialize());
        assert_eq!(frames, vec![ping_rsp()]);
        assert_eq!(decoder.stats().frames, 1);
    }

    #[test]
    fn test_byte_at_a_time_equivalence() {
        let mut stream = Vec::new();
        stream.extend(ping_rsp().serialize());
        stream.extend(incoming_msg().serialize());
        stream.extend(ping_rsp().serialize());

        let mut all_at_once = FrameDecoder::new();
        let bulk = all_at_once.feed(&stream);

        let mut one_by_one = FrameDecoder::new();
        let mut dripped = Vec::new();
        for &byte in &stream {
            dripped.extend(one_by_one.feed(&[byte]));
        }

        assert_eq!(bulk, dripped);
        assert_eq!(bulk.len(), 3);
        assert_eq!(all_at_once.stats(), one_by_one.stats());
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![0x00, 0x12, 0x34, 0xAB];
        stream.extend(ping_rsp().serialize());

        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![ping_rsp()]);
        assert_eq!(decoder.stats().bytes_skipped, 4);
    }

    #[test]
    fn test_bad_fcs_dropped_neighbours_survive() {
        let mut corrupted = incoming_msg().serialize();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        let mut stream = ping_rsp().serialize();
        stream.extend(corrupted);
        stream.extend(ping_rsp().serialize());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![ping_rsp(), ping_rsp()]);
        assert_eq!(decoder.stats().framing_errors, 1);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![SOF, 0xFB, 0x21, 0x01];
        stream.extend(ping_rsp().serialize());

        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![ping_rsp()]);
        assert_eq!(decoder.stats().framing_errors, 1);
    }

    #[test]
    fn test_single_byte_corruption_never_yields_wrong_frame() {
        let original = incoming_msg();
        let encoded = original.serialize();

        // Corrupt every byte position except SOF in turn
        for pos in 1..encoded.len() {
            let mut stream = encoded.clone();
            stream[pos] ^= 0x5A;

            let mut decoder = FrameDecoder::new();
            let frames = decoder.feed(&stream);
            assert!(
                frames.is_empty(),
                "corrupting byte {pos} produced a frame: {frames:?}"
            );
        }
    }
}
