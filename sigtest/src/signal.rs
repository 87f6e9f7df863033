//! The test signal and its wire encoding.
//!
//! A [`Signal`] is a one-way, fire-and-forget message.  Its body is encoded
//! with a fixed field order agreed by every peer; no I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  offset  size  field
//!  ------  ----  ---------------------------------------------
//!       0     4  sequence number
//!       4     8  send time, whole seconds since the epoch
//!      12     2  send time, millisecond remainder
//!      14     4  payload length (N)
//!      18     N  payload bytes
//!    18+N     4  TTL in seconds (0 = infinite)
//!    22+N     4  infinite-TTL sequence number
//! ```
//!
//! Fixed overhead: [`FIXED_LEN`] = 26 bytes.

use thiserror::Error;

use crate::clock::Timestamp;

/// Smallest payload a generator will produce.
pub const MIN_PAYLOAD: usize = 50;

/// Largest payload a generator will produce.
pub const MAX_PAYLOAD: usize = 130_000;

/// TTL value meaning "never expires".
pub const INFINITE_TTL: u32 = 0;

/// Bytes of the encoding that do not depend on the payload.
pub const FIXED_LEN: usize = 26;

// Byte offsets of the fields preceding the payload.
const OFF_SEQ: usize = 0;
const OFF_SECONDS: usize = 4;
const OFF_MILLIS: usize = 12;
const OFF_PAYLOAD_LEN: usize = 14;
const OFF_PAYLOAD: usize = 18;

/// One sequence-numbered, timestamped test message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Per-sender sequence number, starting at 1.
    pub seq: u32,
    /// Sender wall clock at generation time, whole seconds.
    pub send_seconds: u64,
    /// Sender wall clock at generation time, millisecond remainder.
    pub send_millis: u16,
    /// Filler bytes; receivers only look at the length.
    pub payload: Vec<u8>,
    /// Time-to-live in seconds, [`INFINITE_TTL`] for unlimited.
    pub ttl_secs: u32,
    /// Position in the infinite-TTL stream.
    pub infinite_ttl_seq: u32,
}

impl Signal {
    pub fn sent_at(&self) -> Timestamp {
        Timestamp::new(self.send_seconds, self.send_millis)
    }

    pub fn is_infinite_ttl(&self) -> bool {
        self.ttl_secs == INFINITE_TTL
    }

    /// Length of the encoded form.
    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + self.payload.len()
    }

    /// Serialise into a newly allocated buffer sized exactly for this signal.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.send_seconds.to_be_bytes());
        buf.extend_from_slice(&self.send_millis.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.ttl_secs.to_be_bytes());
        buf.extend_from_slice(&self.infinite_ttl_seq.to_be_bytes());
        buf
    }

    /// Parse a signal body.
    ///
    /// Returns [`Err`] if the buffer ends before a field is complete or if
    /// bytes remain after the last field.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(buf);
        let seq = r.u32()?;
        let send_seconds = r.u64()?;
        let send_millis = r.u16()?;
        let payload_len = r.u32()? as usize;
        let payload = r.take(payload_len)?.to_vec();
        let ttl_secs = r.u32()?;
        let infinite_ttl_seq = r.u32()?;
        r.finish()?;

        Ok(Signal {
            seq,
            send_seconds,
            send_millis,
            payload,
            ttl_secs,
            infinite_ttl_seq,
        })
    }
}

/// Errors that can arise when parsing received bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field extends past the end of the buffer.
    #[error("truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    /// Bytes left over after the last field.
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    /// Frame type byte not recognised.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),
    /// A name field is not valid UTF-8.
    #[error("name field is not valid UTF-8")]
    InvalidName,
}

/// Cursor over a received buffer yielding big-endian fields.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Fail unless every byte has been consumed.
    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_signal(seq: u32, payload_len: usize, ttl_secs: u32, inf: u32) -> Signal {
        Signal {
            seq,
            send_seconds: 1_700_000_000,
            send_millis: 999,
            payload: vec![0xab; payload_len],
            ttl_secs,
            infinite_ttl_seq: inf,
        }
    }

    #[test]
    fn encode_decode_smallest_payload() {
        let sig = make_signal(1, MIN_PAYLOAD, 30, 1);
        assert_eq!(Signal::decode(&sig.encode()).unwrap(), sig);
    }

    #[test]
    fn encode_decode_largest_payload_and_ttl() {
        let sig = make_signal(u32::MAX, MAX_PAYLOAD, u32::MAX, 77);
        let bytes = sig.encode();
        assert_eq!(bytes.len(), FIXED_LEN + MAX_PAYLOAD);
        assert_eq!(Signal::decode(&bytes).unwrap(), sig);
    }

    #[test]
    fn infinite_ttl_flag() {
        assert!(make_signal(1, 50, INFINITE_TTL, 1).is_infinite_ttl());
        assert!(!make_signal(1, 50, 30, 1).is_infinite_ttl());
    }

    #[test]
    fn fields_are_big_endian_in_fixed_order() {
        let sig = Signal {
            seq: 0x0102_0304,
            send_seconds: 0x1112_1314_1516_1718,
            send_millis: 0x2122,
            payload: vec![0xee; 2],
            ttl_secs: 0x3132_3334,
            infinite_ttl_seq: 0x4142_4344,
        };
        let b = sig.encode();
        assert_eq!(&b[OFF_SEQ..OFF_SECONDS], &[1, 2, 3, 4]);
        assert_eq!(
            &b[OFF_SECONDS..OFF_MILLIS],
            &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]
        );
        assert_eq!(&b[OFF_MILLIS..OFF_PAYLOAD_LEN], &[0x21, 0x22]);
        assert_eq!(&b[OFF_PAYLOAD_LEN..OFF_PAYLOAD], &[0, 0, 0, 2]);
        assert_eq!(&b[OFF_PAYLOAD..OFF_PAYLOAD + 2], &[0xee, 0xee]);
        assert_eq!(&b[OFF_PAYLOAD + 2..OFF_PAYLOAD + 6], &[0x31, 0x32, 0x33, 0x34]);
        assert_eq!(&b[OFF_PAYLOAD + 6..], &[0x41, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn decode_empty_buffer_is_truncated() {
        assert_eq!(
            Signal::decode(&[]),
            Err(DecodeError::Truncated {
                offset: 0,
                needed: 4
            })
        );
    }

    #[test]
    fn decode_missing_trailer_is_truncated() {
        let mut bytes = make_signal(5, 60, 30, 1).encode();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Signal::decode(&bytes),
            Err(DecodeError::Truncated { needed: 3, .. })
        ));
    }

    #[test]
    fn decode_payload_length_past_end_is_truncated() {
        let mut bytes = make_signal(5, 60, 30, 1).encode();
        bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD].copy_from_slice(&10_000u32.to_be_bytes());
        assert!(matches!(
            Signal::decode(&bytes),
            Err(DecodeError::Truncated { offset: OFF_PAYLOAD, .. })
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = make_signal(5, 60, 30, 1).encode();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(Signal::decode(&bytes), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn sent_at_matches_fields() {
        let sig = make_signal(1, 50, 30, 1);
        assert_eq!(sig.sent_at(), Timestamp::new(1_700_000_000, 999));
    }
}
