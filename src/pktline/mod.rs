//! Pkt-line codec (`spec.md` §4.1): Git's length-prefixed wire frame format.
//!
//! A frame is a 4-character lowercase-hex length (covering the length
//! header itself and the payload) followed by that many bytes. The special
//! value `0000` (flush) carries no payload. Out-of-band frames for
//! server-to-client sideband messages prefix the payload with a one-byte
//! channel indicator (`\x02` progress, `\x03` error).

pub mod stream;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::GatewayError;

/// Sideband channel a frame is encoded for. `Data` frames carry no channel
/// byte; `Progress`/`Error` are out-of-band (`spec.md` §3 "sideband").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Progress,
    Error,
}

const CHANNEL_PROGRESS: u8 = 0x02;
const CHANNEL_ERROR: u8 = 0x03;

/// `encodePacket(type, message)`: prepend the channel byte for
/// message/error frames, append a trailing newline if the message doesn't
/// already end with one, then prepend the 4-hex length.
#[must_use]
pub fn encode_packet(kind: PacketType, message: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(message.len() + 2);
    match kind {
        PacketType::Progress => payload.put_u8(CHANNEL_PROGRESS),
        PacketType::Error => payload.put_u8(CHANNEL_ERROR),
        PacketType::Data => {}
    }
    payload.extend_from_slice(message);
    if !payload.ends_with(b"\n") {
        payload.put_u8(b'\n');
    }

    let total_len = payload.len() + 4;
    let mut out = BytesMut::with_capacity(total_len);
    out.extend_from_slice(format!("{total_len:04x}").as_bytes());
    out.extend_from_slice(&payload);
    out.freeze()
}

/// The flush packet: `0000`, length zero, no payload.
#[must_use]
pub fn encode_flush() -> Bytes {
    Bytes::from_static(b"0000")
}

/// `readPacketLength(buf, offset=0)`: the integer length of the frame
/// starting at `offset`, or `None` when fewer than 4 bytes remain or the 4
/// bytes aren't all lowercase hex (the spec's `-1` sentinel).
#[must_use]
pub fn read_packet_length(buf: &[u8], offset: usize) -> Option<usize> {
    let header = buf.get(offset..offset + 4)?;
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    // Reject uppercase hex: the wire format mandates lowercase.
    if header.iter().any(u8::is_ascii_uppercase) {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// Lazily scans complete pkt-line frames out of `buf`.
///
/// Mirrors `iteratePackets(buf, stopOnFlush, tolerateTruncation)`: yields
/// each frame's payload (length header stripped) in order, stops at the
/// first flush when `stop_on_flush` is set, and either tolerates or raises
/// on a frame whose declared length exceeds what remains in `buf`.
pub struct PacketIter<'a> {
    buf: &'a [u8],
    pos: usize,
    stop_on_flush: bool,
    tolerate_truncation: bool,
    done: bool,
    flushed: bool,
}

impl<'a> PacketIter<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], stop_on_flush: bool, tolerate_truncation: bool) -> Self {
        Self {
            buf,
            pos: 0,
            stop_on_flush,
            tolerate_truncation,
            done: false,
            flushed: false,
        }
    }

    /// Byte offset into `buf` up to which frames have been fully consumed.
    /// Includes the flush packet's own 4 bytes when [`Self::flushed`].
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether iteration stopped because a flush packet was consumed (as
    /// opposed to running out of buffer or erroring).
    #[must_use]
    pub fn flushed(&self) -> bool {
        self.flushed
    }

    /// The unconsumed tail of `buf`: bytes after the flush packet when
    /// [`Self::flushed`], or the dangling partial frame otherwise.
    #[must_use]
    pub fn remainder(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<&'a [u8], GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let rest = &self.buf[self.pos..];

            let Some(len) = read_packet_length(rest, 0) else {
                self.done = true;
                if rest.len() < 4 && self.tolerate_truncation {
                    return None;
                }
                return Some(Err(GatewayError::InvalidPacket {
                    reason: "unparseable pkt-line length header".to_owned(),
                }));
            };

            if len == 0 {
                self.pos += 4;
                if self.stop_on_flush {
                    self.flushed = true;
                    self.done = true;
                    return None;
                }
                continue;
            }

            if (1..4).contains(&len) {
                self.done = true;
                return Some(Err(GatewayError::InvalidPacket {
                    reason: format!("pkt-line length {len} falls in the reserved 1..3 range"),
                }));
            }

            if len > rest.len() {
                self.done = true;
                if self.tolerate_truncation {
                    return None;
                }
                return Some(Err(GatewayError::InvalidPacket {
                    reason: format!(
                        "pkt-line declares length {len} but only {} bytes remain",
                        rest.len()
                    ),
                }));
            }

            self.pos += len;
            return Some(Ok(&rest[4..len]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_packet_length_boundary_values() {
        assert_eq!(read_packet_length(b"0000", 0), Some(0));
        assert_eq!(read_packet_length(b"0004", 0), Some(4));
        assert_eq!(read_packet_length(b"ffff", 0), Some(0xffff));
        assert_eq!(read_packet_length(b"000", 0), None);
        assert_eq!(read_packet_length(b"", 0), None);
        assert_eq!(read_packet_length(b"000g", 0), None);
        assert_eq!(read_packet_length(b"00FF", 0), None);
    }

    #[test]
    fn read_packet_length_is_never_in_reserved_range() {
        for probe in ["0000", "0004", "ffff", "abcd"] {
            let n = read_packet_length(probe.as_bytes(), 0);
            assert!(n.is_none() || n == Some(0) || (4..=0xffff).contains(&n.unwrap()));
        }
    }

    #[test]
    fn iterates_frames_up_to_flush() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"0009want\n");
        buf.extend_from_slice(b"0009have\n");
        buf.extend_from_slice(b"0000");
        buf.extend_from_slice(b"PACKDATA");

        let mut iter = PacketIter::new(&buf, true, true);
        assert_eq!(iter.next().unwrap().unwrap(), b"want\n");
        assert_eq!(iter.next().unwrap().unwrap(), b"have\n");
        assert!(iter.next().is_none());
        assert!(iter.flushed());
        assert_eq!(iter.remainder(), b"PACKDATA");
    }

    #[test]
    fn reserved_length_range_is_invalid() {
        let buf = b"0001x";
        let mut iter = PacketIter::new(buf, true, true);
        assert!(matches!(
            iter.next(),
            Some(Err(GatewayError::InvalidPacket { .. }))
        ));
    }

    #[test]
    fn truncation_tolerated_or_rejected() {
        let buf = b"0020short";

        let mut tolerant = PacketIter::new(buf, true, true);
        assert!(tolerant.next().is_none());
        assert!(!tolerant.flushed());
        assert_eq!(tolerant.remainder(), &buf[..]);

        let mut strict = PacketIter::new(buf, true, false);
        assert!(matches!(
            strict.next(),
            Some(Err(GatewayError::InvalidPacket { .. }))
        ));
    }

    #[test]
    fn encode_packet_roundtrip() {
        let encoded = encode_packet(PacketType::Data, b"want abc");
        assert_eq!(&encoded[..4], b"0011");
        let mut iter = PacketIter::new(&encoded, false, false);
        assert_eq!(iter.next().unwrap().unwrap(), b"want abc\n");

        let msg = encode_packet(PacketType::Progress, b"hello");
        assert_eq!(msg[4], 0x02);
        assert!(msg.ends_with(b"\n"));

        let err = encode_packet(PacketType::Error, b"bad thing");
        assert_eq!(err[4], 0x03);
    }

    #[test]
    fn non_flush_frames_never_stop_without_stop_on_flush() {
        let buf = b"0000";
        let mut iter = PacketIter::new(buf, false, false);
        assert!(iter.next().is_none());
        assert_eq!(iter.position(), 4);
    }
}
