//! # Frame codec
//!
//! The expander frames every message like this:
//!
//! ```text
//! ┌─────┬────┬─────┬──────┬────────────┬──────────────┬────────────┐
//! │ SOF │ ID │ LEN │ TYPE │ HEAD_CKSUM │ DATA (LEN B) │ DATA_CKSUM │
//! │ 01  │ 1B │ 1B  │ 1B   │ 1B         │              │ 1B if LEN>0│
//! └─────┴────┴─────┴──────┴────────────┴──────────────┴────────────┘
//! ```
//!
//! Both checksums are the inverted XOR over the bytes they cover. The
//! head checksum covers SOF, ID, LEN and TYPE.
//!
//! [`FrameDecoder`] accumulates incoming bytes and yields complete
//! frames. A single read from the port may contain part of a frame or
//! several frames back to back.

use tracing::warn;

/// Start-of-frame marker.
pub const SOF: u8 = 0x01;

/// Bytes in front of the payload: SOF, ID, LEN, TYPE and head checksum.
pub const HEADER_SIZE: usize = 5;

/// Largest payload a frame can carry (LEN is a single byte).
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Set in the ID of every frame the host originates.
pub const MASTER_ID_BIT: u8 = 0x80;

/// The payload does not fit into a single frame.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Payload of {len} bytes exceeds the frame limit of {MAX_PAYLOAD_SIZE} bytes")]
pub struct PayloadTooLarge {
    /// Length of the rejected payload.
    pub len: usize,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame id as chosen by the sender.
    pub id: u8,
    /// The raw TYPE byte. The link interprets it as a channel id.
    pub frame_type: u8,
    /// The frame payload.
    pub payload: Vec<u8>,
}

/// Compute the inverted XOR checksum over `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode a payload into a complete frame.
pub fn encode_frame(id: u8, frame_type: u8, payload: &[u8]) -> Result<Vec<u8>, PayloadTooLarge> {
    let len = u8::try_from(payload.len()).map_err(|_| PayloadTooLarge { len: payload.len() })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + 1);
    frame.extend_from_slice(&[SOF, id, len, frame_type]);
    frame.push(checksum(&frame));

    if !payload.is_empty() {
        frame.extend_from_slice(payload);
        frame.push(checksum(payload));
    }

    Ok(frame)
}

/// Decoder state machine.
#[derive(Debug)]
enum DecoderState {
    /// Skipping bytes until the next SOF.
    Hunting,
    /// SOF seen, collecting ID, LEN, TYPE and head checksum.
    Header { collected: usize },
    /// Header accepted, collecting payload bytes.
    Payload,
    /// Payload complete, waiting for its checksum.
    PayloadChecksum,
}

/// Streaming frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    header: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    expected: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder that waits for the first SOF.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecoderState::Hunting,
            header: [0; HEADER_SIZE],
            payload: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            expected: 0,
        }
    }

    /// Feed bytes into the decoder and return every frame they
    /// completed, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter().filter_map(|&byte| self.push(byte)).collect()
    }

    /// Feed a single byte.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecoderState::Hunting => {
                if byte == SOF {
                    self.header[0] = byte;
                    self.state = DecoderState::Header { collected: 1 };
                }
                None
            }

            DecoderState::Header { collected } => {
                self.header[collected] = byte;
                let collected = collected + 1;

                if collected < HEADER_SIZE {
                    self.state = DecoderState::Header { collected };
                    return None;
                }

                if checksum(&self.header[..HEADER_SIZE - 1]) != self.header[HEADER_SIZE - 1] {
                    warn!("dropping frame with bad head checksum: {:02x?}", self.header);
                    self.state = DecoderState::Hunting;
                    return None;
                }

                self.expected = self.header[2].into();
                self.payload.clear();

                if self.expected == 0 {
                    self.state = DecoderState::Hunting;
                    return Some(self.finish());
                }

                self.state = DecoderState::Payload;
                None
            }

            DecoderState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.expected {
                    self.state = DecoderState::PayloadChecksum;
                }
                None
            }

            DecoderState::PayloadChecksum => {
                self.state = DecoderState::Hunting;

                if checksum(&self.payload) != byte {
                    warn!(
                        "dropping frame id {:#04x} with bad data checksum ({} bytes)",
                        self.header[1],
                        self.payload.len()
                    );
                    return None;
                }

                Some(self.finish())
            }
        }
    }

    fn finish(&mut self) -> Frame {
        Frame {
            id: self.header[1],
            frame_type: self.header[3],
            payload: std::mem::take(&mut self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_inverted_xor() {
        assert_eq!(checksum(&[]), 0xff);
        assert_eq!(checksum(&[0x01, 0x80, 0x00, 0x02]), !(0x01 ^ 0x80 ^ 0x02));
    }

    #[test]
    fn empty_payload_has_no_data_checksum() {
        let frame = encode_frame(0x81, 0x02, &[]).unwrap();

        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(frame[0], SOF);
        assert_eq!(frame[2], 0);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        assert_eq!(
            encode_frame(0x80, 0x02, &[0; 256]),
            Err(PayloadTooLarge { len: 256 })
        );
        assert!(encode_frame(0x80, 0x02, &[0; 255]).is_ok());
    }

    #[test]
    fn decoder_handles_split_and_concatenated_frames() {
        let mut wire = encode_frame(0x81, 0x02, b"hello").unwrap();
        wire.extend(encode_frame(0x82, 0x05, &[]).unwrap());
        wire.extend(encode_frame(0x83, 0x02, &[0xaa; 200]).unwrap());

        let mut decoder = FrameDecoder::new();
        let (first, second) = wire.split_at(7);

        assert!(decoder.feed(first).is_empty());
        let frames = decoder.feed(second);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].id, 0x81);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[1].frame_type, 0x05);
        assert!(frames[1].payload.is_empty());
        assert_eq!(frames[2].payload, vec![0xaa; 200]);
    }

    #[test]
    fn decoder_skips_garbage_and_corrupt_frames() {
        let mut corrupt = encode_frame(0x81, 0x02, b"abc").unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;

        let mut wire = vec![0xde, 0xad];
        wire.extend(corrupt);
        wire.extend(encode_frame(0x82, 0x02, b"ok").unwrap());

        let frames = FrameDecoder::new().feed(&wire);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x82);
        assert_eq!(frames[0].payload, b"ok");
    }

    #[test]
    fn bad_head_checksum_resynchronizes() {
        let mut bad = encode_frame(0x81, 0x02, b"xyz").unwrap();
        bad[4] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bad[..HEADER_SIZE]).is_empty());

        let frames = decoder.feed(&encode_frame(0x82, 0x02, b"zz").unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"zz");
    }
}
