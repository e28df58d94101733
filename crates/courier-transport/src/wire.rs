//! # Courier Wire Format
//!
//! Fixed-width, big-endian framing for the five message kinds in `spec.md`
//! §4.1. Every message starts with a two-byte common prefix (`kind`,
//! `version`) followed by a kind-specific body. A datagram never exceeds
//! [`MAX_DATAGRAM_SIZE`] bytes, header included.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_core::error::CourierError;
use courier_core::ids::BundleId;

/// Protocol version encoded in every message's second byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload carried by a single DATA message.
pub const MAX_PAYLOAD_LEN: usize = 1150;

/// Maximum size of any encoded datagram, header included.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Size of the common `kind` + `version` prefix.
const PREFIX_LEN: usize = 2;

/// Size of a `bundle_id` field on the wire.
const BUNDLE_ID_LEN: usize = 16;

// ─── Message Kind ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Data = 1,
    Sack = 2,
    CustodyReq = 3,
    CustodyAck = 4,
    Delivered = 5,
}

impl MessageKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageKind::Data),
            2 => Some(MessageKind::Sack),
            3 => Some(MessageKind::CustodyReq),
            4 => Some(MessageKind::CustodyAck),
            5 => Some(MessageKind::Delivered),
            _ => None,
        }
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

const FLAG_PARITY: u8 = 0b0000_0001;

// ─── DATA ────────────────────────────────────────────────────────────────────

/// A DATA message: one chunk (data or parity) of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub bundle_id: BundleId,
    pub chunk_id: u32,
    pub total_chunks: u32,
    pub block_id: u32,
    pub k: u8,
    pub r: u8,
    pub is_parity: bool,
    pub checksum: u32,
    pub payload: Bytes,
}

impl DataMessage {
    /// Build a DATA message, computing its checksum from the payload.
    pub fn new(
        bundle_id: BundleId,
        chunk_id: u32,
        total_chunks: u32,
        block_id: u32,
        k: u8,
        r: u8,
        is_parity: bool,
        payload: Bytes,
    ) -> Self {
        let checksum = crc32fast::hash(&payload);
        DataMessage {
            bundle_id,
            chunk_id,
            total_chunks,
            block_id,
            k,
            r,
            is_parity,
            checksum,
            payload,
        }
    }

    const HEADER_LEN: usize = PREFIX_LEN + BUNDLE_ID_LEN + 4 + 4 + 4 + 1 + 1 + 1 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageKind::Data as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id.as_bytes());
        buf.put_u32(self.chunk_id);
        buf.put_u32(self.total_chunks);
        buf.put_u32(self.block_id);
        buf.put_u8(self.k);
        buf.put_u8(self.r);
        let flags = if self.is_parity { FLAG_PARITY } else { 0 };
        buf.put_u8(flags);
        buf.put_u32(self.checksum);
        buf.extend_from_slice(&self.payload);
    }

    fn decode(mut buf: Bytes) -> Result<Self, CourierError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(CourierError::MalformedMessage("DATA header too short".into()));
        }
        let bundle_id = read_bundle_id(&mut buf);
        let chunk_id = buf.get_u32();
        let total_chunks = buf.get_u32();
        let block_id = buf.get_u32();
        let k = buf.get_u8();
        let r = buf.get_u8();
        let flags = buf.get_u8();
        let checksum = buf.get_u32();
        let payload = buf; // remainder

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CourierError::MalformedMessage("DATA payload too large".into()));
        }
        if crc32fast::hash(&payload) != checksum {
            return Err(CourierError::BadChecksum);
        }

        Ok(DataMessage {
            bundle_id,
            chunk_id,
            total_chunks,
            block_id,
            k,
            r,
            is_parity: flags & FLAG_PARITY != 0,
            checksum,
            payload,
        })
    }
}

// ─── SACK ────────────────────────────────────────────────────────────────────

/// A selective-acknowledgment bitmap anchored at `recv_watermark`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackMessage {
    pub bundle_id: BundleId,
    pub recv_watermark: u32,
    pub bitmap: Bytes,
}

impl SackMessage {
    const HEADER_LEN: usize = PREFIX_LEN + BUNDLE_ID_LEN + 4 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageKind::Sack as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id.as_bytes());
        buf.put_u32(self.recv_watermark);
        buf.put_u32(self.bitmap.len() as u32);
        buf.extend_from_slice(&self.bitmap);
    }

    fn decode(mut buf: Bytes) -> Result<Self, CourierError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(CourierError::MalformedMessage("SACK header too short".into()));
        }
        let bundle_id = read_bundle_id(&mut buf);
        let recv_watermark = buf.get_u32();
        let bitmap_length = buf.get_u32() as usize;
        if buf.len() != bitmap_length {
            return Err(CourierError::MalformedMessage(
                "SACK bitmap length inconsistent".into(),
            ));
        }
        let bitmap = buf;
        Ok(SackMessage {
            bundle_id,
            recv_watermark,
            bitmap,
        })
    }

    /// Whether bit `i` (chunk `recv_watermark + i`) is set.
    pub fn is_set(&self, i: u32) -> bool {
        let byte = (i / 8) as usize;
        let bit = i % 8;
        self.bitmap
            .get(byte)
            .map(|b| b & (1 << bit) != 0)
            .unwrap_or(false)
    }
}

// ─── Custody ranges ──────────────────────────────────────────────────────────

/// An inclusive `[start, end]` range of chunk ids under a custody obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u32,
    pub end: u32,
}

fn encode_ranges(buf: &mut BytesMut, ranges: &[ChunkRange]) {
    buf.put_u16(ranges.len() as u16);
    for range in ranges {
        buf.put_u32(range.start);
        buf.put_u32(range.end);
    }
}

fn decode_ranges(buf: &mut Bytes) -> Result<Vec<ChunkRange>, CourierError> {
    if buf.len() < 2 {
        return Err(CourierError::MalformedMessage("missing range_count".into()));
    }
    let count = buf.get_u16() as usize;
    if buf.len() != count * 8 {
        return Err(CourierError::MalformedMessage(
            "range list length inconsistent".into(),
        ));
    }
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let start = buf.get_u32();
        let end = buf.get_u32();
        ranges.push(ChunkRange { start, end });
    }
    Ok(ranges)
}

/// A CUSTODY_REQ message: an upstream node offering ranges for a relay to
/// hold, and the bundle's final destination so an accepting relay knows
/// where to forward the assembled bundle once it completes its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyReqMessage {
    pub bundle_id: BundleId,
    pub ttl_remaining: u32,
    pub dst: String,
    pub ranges: Vec<ChunkRange>,
}

impl CustodyReqMessage {
    const HEADER_LEN: usize = PREFIX_LEN + BUNDLE_ID_LEN + 4 + 2;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageKind::CustodyReq as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id.as_bytes());
        buf.put_u32(self.ttl_remaining);
        let dst_bytes = self.dst.as_bytes();
        buf.put_u16(dst_bytes.len() as u16);
        buf.extend_from_slice(dst_bytes);
        encode_ranges(buf, &self.ranges);
    }

    fn decode(mut buf: Bytes) -> Result<Self, CourierError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(CourierError::MalformedMessage(
                "CUSTODY_REQ header too short".into(),
            ));
        }
        let bundle_id = read_bundle_id(&mut buf);
        let ttl_remaining = buf.get_u32();
        let dst_len = buf.get_u16() as usize;
        if buf.len() < dst_len {
            return Err(CourierError::MalformedMessage("CUSTODY_REQ dst truncated".into()));
        }
        let dst_bytes = buf.split_to(dst_len);
        let dst = String::from_utf8(dst_bytes.to_vec())
            .map_err(|_| CourierError::MalformedMessage("CUSTODY_REQ dst not utf-8".into()))?;
        let ranges = decode_ranges(&mut buf)?;
        Ok(CustodyReqMessage {
            bundle_id,
            ttl_remaining,
            dst,
            ranges,
        })
    }
}

/// A CUSTODY_ACK message: confirmation that a relay now holds the ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyAckMessage {
    pub bundle_id: BundleId,
    pub ack_nonce: u64,
    pub ranges: Vec<ChunkRange>,
}

impl CustodyAckMessage {
    const HEADER_LEN: usize = PREFIX_LEN + BUNDLE_ID_LEN + 8;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageKind::CustodyAck as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id.as_bytes());
        buf.put_u64(self.ack_nonce);
        encode_ranges(buf, &self.ranges);
    }

    fn decode(mut buf: Bytes) -> Result<Self, CourierError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(CourierError::MalformedMessage(
                "CUSTODY_ACK header too short".into(),
            ));
        }
        let bundle_id = read_bundle_id(&mut buf);
        let ack_nonce = buf.get_u64();
        let ranges = decode_ranges(&mut buf)?;
        Ok(CustodyAckMessage {
            bundle_id,
            ack_nonce,
            ranges,
        })
    }
}

/// A DELIVERED message: the bundle has been fully assembled at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub bundle_id: BundleId,
}

impl DeliveredMessage {
    const HEADER_LEN: usize = PREFIX_LEN + BUNDLE_ID_LEN;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageKind::Delivered as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id.as_bytes());
    }

    fn decode(mut buf: Bytes) -> Result<Self, CourierError> {
        if buf.len() != Self::HEADER_LEN - PREFIX_LEN {
            return Err(CourierError::MalformedMessage(
                "DELIVERED length inconsistent".into(),
            ));
        }
        let bundle_id = read_bundle_id(&mut buf);
        Ok(DeliveredMessage { bundle_id })
    }
}

fn read_bundle_id(buf: &mut Bytes) -> BundleId {
    let mut raw = [0u8; BUNDLE_ID_LEN];
    buf.copy_to_slice(&mut raw);
    BundleId::from_bytes(raw)
}

// ─── Envelope ────────────────────────────────────────────────────────────────

/// A decoded wire message of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(DataMessage),
    Sack(SackMessage),
    CustodyReq(CustodyReqMessage),
    CustodyAck(CustodyAckMessage),
    Delivered(DeliveredMessage),
}

impl Message {
    pub fn bundle_id(&self) -> BundleId {
        match self {
            Message::Data(m) => m.bundle_id,
            Message::Sack(m) => m.bundle_id,
            Message::CustodyReq(m) => m.bundle_id,
            Message::CustodyAck(m) => m.bundle_id,
            Message::Delivered(m) => m.bundle_id,
        }
    }

    /// Encode this message to wire bytes. Panics if the result would exceed
    /// [`MAX_DATAGRAM_SIZE`] — callers are expected to respect the MTU when
    /// constructing messages (e.g. chunking payloads to
    /// [`MAX_PAYLOAD_LEN`]).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Message::Data(m) => m.encode(&mut buf),
            Message::Sack(m) => m.encode(&mut buf),
            Message::CustodyReq(m) => m.encode(&mut buf),
            Message::CustodyAck(m) => m.encode(&mut buf),
            Message::Delivered(m) => m.encode(&mut buf),
        }
        assert!(
            buf.len() <= MAX_DATAGRAM_SIZE,
            "encoded message exceeds MTU: {} bytes",
            buf.len()
        );
        buf.freeze()
    }

    /// Decode a message from raw datagram bytes.
    pub fn decode(data: Bytes) -> Result<Self, CourierError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(CourierError::MalformedMessage("datagram exceeds MTU".into()));
        }
        if data.len() < PREFIX_LEN {
            return Err(CourierError::MalformedMessage("datagram too short".into()));
        }
        let kind_byte = data[0];
        let version = data[1];
        if version != PROTOCOL_VERSION {
            return Err(CourierError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_byte(kind_byte)
            .ok_or_else(|| CourierError::MalformedMessage(format!("unknown kind {kind_byte}")))?;
        let body = data.slice(PREFIX_LEN..);
        match kind {
            MessageKind::Data => DataMessage::decode(body).map(Message::Data),
            MessageKind::Sack => SackMessage::decode(body).map(Message::Sack),
            MessageKind::CustodyReq => CustodyReqMessage::decode(body).map(Message::CustodyReq),
            MessageKind::CustodyAck => CustodyAckMessage::decode(body).map(Message::CustodyAck),
            MessageKind::Delivered => DeliveredMessage::decode(body).map(Message::Delivered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid() -> BundleId {
        BundleId::from_bytes([7u8; 16])
    }

    #[test]
    fn data_roundtrip() {
        let msg = Message::Data(DataMessage::new(
            bid(),
            3,
            10,
            0,
            4,
            2,
            false,
            Bytes::from_static(b"hello world"),
        ));
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn data_parity_flag_roundtrip() {
        let msg = Message::Data(DataMessage::new(
            bid(),
            100,
            10,
            2,
            4,
            2,
            true,
            Bytes::from_static(b"parity-bytes"),
        ));
        let encoded = msg.encode();
        match Message::decode(encoded).unwrap() {
            Message::Data(d) => assert!(d.is_parity),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn data_bad_checksum_rejected() {
        let msg = DataMessage::new(bid(), 0, 1, 0, 1, 0, false, Bytes::from_static(b"abc"));
        let mut encoded = BytesMut::from(&msg.encode()[..]);
        // Flip a payload byte without fixing the checksum.
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let err = Message::decode(encoded.freeze()).unwrap_err();
        assert!(matches!(err, CourierError::BadChecksum));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.put_u8(PROTOCOL_VERSION);
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CourierError::MalformedMessage(_)));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::Delivered as u8);
        buf.put_u8(99);
        buf.extend_from_slice(&[0u8; BUNDLE_ID_LEN]);
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CourierError::UnsupportedVersion(99)));
    }

    #[test]
    fn truncated_message_is_malformed() {
        let err = Message::decode(Bytes::from_static(&[1])).unwrap_err();
        assert!(matches!(err, CourierError::MalformedMessage(_)));
    }

    #[test]
    fn sack_roundtrip_and_bit_reads() {
        let mut bitmap = BytesMut::new();
        bitmap.put_u8(0b0000_0101); // bits 0 and 2 set
        let msg = Message::Sack(SackMessage {
            bundle_id: bid(),
            recv_watermark: 40,
            bitmap: bitmap.freeze(),
        });
        let encoded = msg.encode();
        match Message::decode(encoded).unwrap() {
            Message::Sack(s) => {
                assert_eq!(s.recv_watermark, 40);
                assert!(s.is_set(0));
                assert!(!s.is_set(1));
                assert!(s.is_set(2));
                assert!(!s.is_set(9));
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn sack_length_mismatch_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::Sack as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(&[0u8; BUNDLE_ID_LEN]);
        buf.put_u32(0);
        buf.put_u32(4); // claims 4 bytes of bitmap
        buf.put_u8(1); // only supplies 1
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CourierError::MalformedMessage(_)));
    }

    #[test]
    fn custody_req_roundtrip() {
        let msg = Message::CustodyReq(CustodyReqMessage {
            bundle_id: bid(),
            ttl_remaining: 300,
            dst: "final-dest:9000".into(),
            ranges: vec![ChunkRange { start: 0, end: 9 }, ChunkRange { start: 20, end: 29 }],
        });
        let encoded = msg.encode();
        assert_eq!(Message::decode(encoded).unwrap(), msg);
    }

    #[test]
    fn custody_ack_roundtrip() {
        let msg = Message::CustodyAck(CustodyAckMessage {
            bundle_id: bid(),
            ack_nonce: 0xDEAD_BEEF_CAFE,
            ranges: vec![ChunkRange { start: 0, end: 9 }],
        });
        let encoded = msg.encode();
        assert_eq!(Message::decode(encoded).unwrap(), msg);
    }

    #[test]
    fn delivered_roundtrip() {
        let msg = Message::Delivered(DeliveredMessage { bundle_id: bid() });
        let encoded = msg.encode();
        assert_eq!(Message::decode(encoded).unwrap(), msg);
    }

    #[test]
    fn max_payload_fits_mtu() {
        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN]);
        let msg = Message::Data(DataMessage::new(bid(), 0, 1, 0, 1, 0, false, payload));
        assert!(msg.encode().len() <= MAX_DATAGRAM_SIZE);
    }
}
