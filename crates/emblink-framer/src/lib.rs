/*! Bit-exact framing for the link.

Three frame kinds ride the wire, all beginning with the same [`SOF`] byte:

```text
DATA: SOF | type/seq/frame_id_hi | frame_id_lo | payload_len-1 | reserved/port_id
      | message_id | port_data_lo | port_data_hi | payload(1..256) | CRC32 (LE)
ACK:  SOF | 0x98|frame_id_hi | frame_id_lo | CRC8
NACK: SOF | 0xD8|frame_id_hi | frame_id_lo | cause_bit|cause_frame_id_hi
      | cause_frame_id_lo | CRC8
```

`CRC8` is the low byte of the same CRC32 used for DATA frames, taken over
the header bytes excluding the CRC byte itself; it is not an independent
8-bit CRC algorithm.

The [`Decoder`] is a byte-at-a-time state machine: feed it one byte via
[`Decoder::feed`], it calls back into a [`FrameSink`] whenever a complete
frame, or a framing/CRC error, is recognized. Any rejected byte sequence
is automatically reprocessed from the position right after the SOF that
started the failed attempt, so a valid frame embedded in a run of
garbage bytes (or directly following a truncated one) is never lost.
*/
#![no_std]

use crc::{Crc, Table, CRC_32_ISO_HDLC};

pub const SOF: u8 = 0x55;
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Total byte length of the largest possible DATA frame.
pub const MAX_DATA_FRAME_LEN: usize = 1 + 7 + MAX_PAYLOAD_LEN + 4;
pub const ACK_FRAME_LEN: usize = 4;
pub const NACK_FRAME_LEN: usize = 6;

/// 11-bit frame identifier space; it wraps at 2048.
pub const FRAME_ID_MODULO: u16 = 2048;
const FRAME_ID_MASK: u16 = 0x07FF;

/// Out-of-range sentinel for `cause_frame_id` used to mark a link reset.
///
/// The wire only has 15 bits available for `cause_frame_id` (one bit of
/// the byte is the cause flag), so the natural `0xFFFF` sentinel does not
/// fit; `0x7FFF`, the largest representable value, is used instead. It is
/// still well outside the valid 11-bit frame-id range (0..2048), so it is
/// unambiguous as a "this isn't really a frame id" marker.
pub const RESET_CAUSE_FRAME_ID: u16 = 0x7FFF;

const FRAMER_CRC32: Crc<u32, Table<1>> = Crc::<u32, Table<1>>::new(&CRC_32_ISO_HDLC);

fn crc32_of(bytes: &[u8]) -> u32 {
    FRAMER_CRC32.checksum(bytes)
}

fn crc8_of(bytes: &[u8]) -> u8 {
    (crc32_of(bytes) & 0xFF) as u8
}

/// The 2-bit segmentation tag carried by every DATA frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Middle = 0b00,
    Stop = 0b01,
    Start = 0b10,
    Single = 0b11,
}

impl Segment {
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Segment::Middle,
            0b01 => Segment::Stop,
            0b10 => Segment::Start,
            _ => Segment::Single,
        }
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DataFrame<'a> {
    pub frame_id: u16,
    pub segment: Segment,
    pub port_id: u8,
    pub message_id: u8,
    pub port_data: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub frame_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCause {
    FrameError,
    OutOfWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackFrame {
    pub frame_id: u16,
    pub cause: NackCause,
    pub cause_frame_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    FrameTooBig,
}

fn split_frame_id(frame_id: u16) -> (u8, u8) {
    let id = frame_id & FRAME_ID_MASK;
    (((id >> 8) & 0x07) as u8, (id & 0xFF) as u8)
}

pub fn encode_data(buf: &mut [u8], frame: &DataFrame) -> Result<usize, EncodeError> {
    let payload_len = frame.payload.len();
    if payload_len == 0 || payload_len > MAX_PAYLOAD_LEN {
        return Err(EncodeError::FrameTooBig);
    }
    let total_len = 1 + 7 + payload_len + 4;
    if buf.len() < total_len {
        return Err(EncodeError::FrameTooBig);
    }

    let (frame_id_hi, frame_id_lo) = split_frame_id(frame.frame_id);
    buf[0] = SOF;
    buf[1] = (frame.segment.bits() << 3) | frame_id_hi;
    buf[2] = frame_id_lo;
    buf[3] = (payload_len - 1) as u8;
    buf[4] = frame.port_id & 0x1F;
    buf[5] = frame.message_id;
    buf[6] = (frame.port_data & 0xFF) as u8;
    buf[7] = (frame.port_data >> 8) as u8;
    buf[8..8 + payload_len].copy_from_slice(frame.payload);

    let crc = crc32_of(&buf[1..8 + payload_len]);
    buf[8 + payload_len..total_len].copy_from_slice(&crc.to_le_bytes());
    Ok(total_len)
}

pub fn encode_ack(buf: &mut [u8], frame: &AckFrame) -> Result<usize, EncodeError> {
    if buf.len() < ACK_FRAME_LEN {
        return Err(EncodeError::FrameTooBig);
    }
    let (frame_id_hi, frame_id_lo) = split_frame_id(frame.frame_id);
    buf[0] = SOF;
    buf[1] = 0x98 | frame_id_hi;
    buf[2] = frame_id_lo;
    buf[3] = crc8_of(&buf[1..3]);
    Ok(ACK_FRAME_LEN)
}

pub fn encode_nack(buf: &mut [u8], frame: &NackFrame) -> Result<usize, EncodeError> {
    if buf.len() < NACK_FRAME_LEN {
        return Err(EncodeError::FrameTooBig);
    }
    let (frame_id_hi, frame_id_lo) = split_frame_id(frame.frame_id);
    let cause_id = frame.cause_frame_id & 0x7FFF;
    let cause_bit = matches!(frame.cause, NackCause::OutOfWindow) as u8;

    buf[0] = SOF;
    buf[1] = 0xD8 | frame_id_hi;
    buf[2] = frame_id_lo;
    buf[3] = (cause_bit << 7) | ((cause_id >> 8) as u8 & 0x7F);
    buf[4] = (cause_id & 0xFF) as u8;
    buf[5] = crc8_of(&buf[1..5]);
    Ok(NACK_FRAME_LEN)
}

/// Receives the frames (or error notifications) an in-progress [`Decoder`]
/// recognizes. Exactly one of these methods is invoked per accepted byte
/// run; see the module documentation for the resync behavior around
/// errors.
pub trait FrameSink {
    fn on_frame(&mut self, frame: &DataFrame);
    fn on_ack(&mut self, frame: AckFrame);
    fn on_nack(&mut self, frame: NackFrame);
    fn on_frame_error(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Data,
    Ack,
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SearchSof,
    SearchFrameType,
    StoreHeader { remaining: u16, kind: FrameKind },
    StorePayload { remaining: u16 },
}

fn classify(byte: u8) -> Option<(FrameKind, u16)> {
    if byte & 0xE0 == 0x00 {
        Some((FrameKind::Data, 6))
    } else if byte & 0xF8 == 0x98 {
        Some((FrameKind::Ack, 2))
    } else if byte & 0xF8 == 0xD8 {
        Some((FrameKind::Nack, 4))
    } else {
        None
    }
}

/// A byte-at-a-time frame decoder with automatic resynchronization.
pub struct Decoder {
    buf: [u8; MAX_DATA_FRAME_LEN],
    len: usize,
    state: State,
    in_sync: bool,
}

impl Decoder {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; MAX_DATA_FRAME_LEN],
            len: 0,
            state: State::SearchSof,
            in_sync: true,
        }
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        debug_assert!(self.len < MAX_DATA_FRAME_LEN);
        self.buf[self.len] = byte;
        self.len += 1;
    }

    fn note_error(&mut self, sink: &mut impl FrameSink) {
        if self.in_sync {
            sink.on_frame_error();
            self.in_sync = false;
        }
    }

    fn reset_to_idle(&mut self) {
        self.len = 0;
        self.state = State::SearchSof;
    }

    /// Discards the current in-progress frame and replays everything after
    /// its SOF byte back through the state machine, since one of those
    /// bytes may itself start a valid frame.
    fn resync(&mut self, sink: &mut impl FrameSink) {
        self.note_error(sink);

        let mut tail = [0u8; MAX_DATA_FRAME_LEN];
        let tail_len = self.len - 1;
        tail[..tail_len].copy_from_slice(&self.buf[1..self.len]);
        self.reset_to_idle();

        for &byte in &tail[..tail_len] {
            self.feed(byte, sink);
        }
    }

    pub fn feed(&mut self, byte: u8, sink: &mut impl FrameSink) {
        match self.state {
            State::SearchSof => {
                if byte == SOF {
                    self.reset_to_idle();
                    self.push(byte);
                    self.state = State::SearchFrameType;
                } else {
                    self.note_error(sink);
                }
            }
            State::SearchFrameType => {
                self.push(byte);
                match classify(byte) {
                    Some((kind, remaining)) => {
                        self.state = State::StoreHeader { remaining, kind };
                    }
                    None => self.resync(sink),
                }
            }
            State::StoreHeader { remaining, kind } => {
                self.push(byte);
                let remaining = remaining - 1;
                if remaining > 0 {
                    self.state = State::StoreHeader { remaining, kind };
                    return;
                }

                match kind {
                    FrameKind::Ack => self.finish_ack(sink),
                    FrameKind::Nack => self.finish_nack(sink),
                    FrameKind::Data => {
                        let payload_len = self.buf[3] as u16 + 1;
                        self.state = State::StorePayload { remaining: payload_len + 4 };
                    }
                }
            }
            State::StorePayload { remaining } => {
                self.push(byte);
                let remaining = remaining - 1;
                if remaining > 0 {
                    self.state = State::StorePayload { remaining };
                } else {
                    self.finish_data(sink);
                }
            }
        }
    }

    fn finish_ack(&mut self, sink: &mut impl FrameSink) {
        let expected = crc8_of(&self.buf[1..3]);
        if self.buf[3] != expected {
            self.resync(sink);
            return;
        }

        let frame_id = ((self.buf[1] as u16 & 0x07) << 8) | self.buf[2] as u16;
        sink.on_ack(AckFrame { frame_id });
        self.in_sync = true;
        self.reset_to_idle();
    }

    fn finish_nack(&mut self, sink: &mut impl FrameSink) {
        let expected = crc8_of(&self.buf[1..5]);
        if self.buf[5] != expected {
            self.resync(sink);
            return;
        }

        let frame_id = ((self.buf[1] as u16 & 0x07) << 8) | self.buf[2] as u16;
        let cause_bit = (self.buf[3] & 0x80) != 0;
        let cause_frame_id = ((self.buf[3] as u16 & 0x7F) << 8) | self.buf[4] as u16;
        let cause = if cause_bit { NackCause::OutOfWindow } else { NackCause::FrameError };

        sink.on_nack(NackFrame { frame_id, cause, cause_frame_id });
        self.in_sync = true;
        self.reset_to_idle();
    }

    fn finish_data(&mut self, sink: &mut impl FrameSink) {
        let payload_len = self.buf[3] as usize + 1;
        let total_len = 1 + 7 + payload_len + 4;

        let expected = crc32_of(&self.buf[1..total_len - 4]);
        let actual = u32::from_le_bytes(self.buf[total_len - 4..total_len].try_into().unwrap());
        if actual != expected {
            self.resync(sink);
            return;
        }

        let frame_id = ((self.buf[1] as u16 & 0x07) << 8) | self.buf[2] as u16;
        let segment = Segment::from_bits(self.buf[1] >> 3);
        let port_id = self.buf[4] & 0x1F;
        let message_id = self.buf[5];
        let port_data = (self.buf[6] as u16) | ((self.buf[7] as u16) << 8);

        sink.on_frame(&DataFrame {
            frame_id,
            segment,
            port_id,
            message_id,
            port_data,
            payload: &self.buf[8..8 + payload_len],
        });
        self.in_sync = true;
        self.reset_to_idle();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(u16, Segment, u8, u8, u16, Vec<u8>)>,
        acks: Vec<AckFrame>,
        nacks: Vec<NackFrame>,
        errors: u32,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, frame: &DataFrame) {
            self.frames.push((
                frame.frame_id,
                frame.segment,
                frame.port_id,
                frame.message_id,
                frame.port_data,
                frame.payload.to_vec(),
            ));
        }
        fn on_ack(&mut self, frame: AckFrame) {
            self.acks.push(frame);
        }
        fn on_nack(&mut self, frame: NackFrame) {
            self.nacks.push(frame);
        }
        fn on_frame_error(&mut self) {
            self.errors += 1;
        }
    }

    fn feed_all(decoder: &mut Decoder, bytes: &[u8], sink: &mut RecordingSink) {
        for &b in bytes {
            decoder.feed(b, sink);
        }
    }

    #[test]
    fn data_round_trip() {
        let frame = DataFrame {
            frame_id: 42,
            segment: Segment::Single,
            port_id: 3,
            message_id: 7,
            port_data: 0x1234,
            payload: b"hello",
        };
        let mut buf = [0u8; MAX_DATA_FRAME_LEN];
        let len = encode_data(&mut buf, &frame).unwrap();

        assert_eq!(&buf[0..8], &[0x55, 0x18, 0x2A, 0x04, 0x03, 0x07, 0x34, 0x12][..]);

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &buf[..len], &mut sink);

        assert_eq!(sink.frames.len(), 1);
        let (frame_id, segment, port_id, message_id, port_data, payload) = &sink.frames[0];
        assert_eq!(*frame_id, 42);
        assert_eq!(*segment, Segment::Single);
        assert_eq!(*port_id, 3);
        assert_eq!(*message_id, 7);
        assert_eq!(*port_data, 0x1234);
        assert_eq!(payload.as_slice(), b"hello");
        assert_eq!(sink.errors, 0);
    }

    #[test]
    fn ack_round_trip() {
        let mut buf = [0u8; ACK_FRAME_LEN];
        let len = encode_ack(&mut buf, &AckFrame { frame_id: 513 }).unwrap();

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &buf[..len], &mut sink);

        assert_eq!(sink.acks, std::vec![AckFrame { frame_id: 513 }]);
    }

    #[test]
    fn nack_round_trip() {
        let nack = NackFrame { frame_id: 7, cause: NackCause::OutOfWindow, cause_frame_id: RESET_CAUSE_FRAME_ID };
        let mut buf = [0u8; NACK_FRAME_LEN];
        let len = encode_nack(&mut buf, &nack).unwrap();

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &buf[..len], &mut sink);

        assert_eq!(sink.nacks.len(), 1);
        assert_eq!(sink.nacks[0], nack);
    }

    #[test]
    fn byte_at_a_time_matches_chunked_feed() {
        let frame = DataFrame { frame_id: 9, segment: Segment::Start, port_id: 1, message_id: 0, port_data: 0, payload: b"abcxyz" };
        let mut buf = [0u8; MAX_DATA_FRAME_LEN];
        let len = encode_data(&mut buf, &frame).unwrap();

        let mut byte_sink = RecordingSink::default();
        let mut byte_decoder = Decoder::new();
        feed_all(&mut byte_decoder, &buf[..len], &mut byte_sink);

        let mut chunk_sink = RecordingSink::default();
        let mut chunk_decoder = Decoder::new();
        for chunk in buf[..len].chunks(3) {
            feed_all(&mut chunk_decoder, chunk, &mut chunk_sink);
        }

        assert_eq!(byte_sink.frames, chunk_sink.frames);
    }

    #[test]
    fn garbage_between_frames_yields_one_error_and_both_frames_survive() {
        let frame1 = DataFrame { frame_id: 1, segment: Segment::Single, port_id: 0, message_id: 0, port_data: 0, payload: b"x" };
        let frame2 = DataFrame { frame_id: 2, segment: Segment::Single, port_id: 0, message_id: 0, port_data: 0, payload: b"y" };

        let mut buf1 = [0u8; MAX_DATA_FRAME_LEN];
        let len1 = encode_data(&mut buf1, &frame1).unwrap();
        let mut buf2 = [0u8; MAX_DATA_FRAME_LEN];
        let len2 = encode_data(&mut buf2, &frame2).unwrap();

        let mut stream: Vec<u8> = Vec::new();
        stream.extend_from_slice(&buf1[..len1]);
        stream.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        stream.extend_from_slice(&buf2[..len2]);

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &stream, &mut sink);

        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.errors, 1);
    }

    #[test]
    fn corrupted_crc_is_rejected_and_does_not_wedge_decoder() {
        let frame = DataFrame { frame_id: 5, segment: Segment::Single, port_id: 2, message_id: 0, port_data: 0, payload: b"z" };
        let mut buf = [0u8; MAX_DATA_FRAME_LEN];
        let len = encode_data(&mut buf, &frame).unwrap();
        buf[len - 1] ^= 0xFF; // corrupt the CRC

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &buf[..len], &mut sink);

        assert_eq!(sink.frames.len(), 0);
        assert_eq!(sink.errors, 1);
    }

    #[test]
    fn max_payload_round_trips() {
        let payload = [0x42u8; MAX_PAYLOAD_LEN];
        let frame = DataFrame { frame_id: 2000, segment: Segment::Stop, port_id: 31, message_id: 255, port_data: 0xFFFF, payload: &payload };
        let mut buf = [0u8; MAX_DATA_FRAME_LEN];
        let len = encode_data(&mut buf, &frame).unwrap();
        assert_eq!(len, MAX_DATA_FRAME_LEN);

        let mut decoder = Decoder::new();
        let mut sink = RecordingSink::default();
        feed_all(&mut decoder, &buf[..len], &mut sink);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].5.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn oversized_payload_rejected_at_encode() {
        let payload = [0u8; MAX_PAYLOAD_LEN + 1];
        let frame = DataFrame { frame_id: 0, segment: Segment::Single, port_id: 0, message_id: 0, port_data: 0, payload: &payload };
        let mut buf = [0u8; MAX_DATA_FRAME_LEN + 8];
        assert_eq!(encode_data(&mut buf, &frame), Err(EncodeError::FrameTooBig));
    }
}
