//! C1: encodes a logical message into one or more fragment packets and
//! decodes a single packet back, with integrity verification.

use bytes::Bytes;
use thiserror::Error;

use crate::{
    header::{MsgType, PacketHeader, HEADER_LEN, MAGIC, MAX_FRAGMENT_BODY, VERSION},
    ids::{PacketId, SeqNum, SnapshotId},
};

/// Reasons a packet is dropped by the codec. Every variant corresponds to a
/// "malformed packet" drop in spec §7 — callers should log at `debug` and
/// otherwise treat this exactly like the packet never arrived.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer shorter than the fixed header")]
    TooShort,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unrecognized message type {0}")]
    BadMsgType(u8),
    #[error("declared payload_len {declared} exceeds available bytes {available}")]
    PayloadTruncated { declared: u16, available: usize },
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// A single decoded, integrity-verified fragment.
#[derive(Debug, Clone)]
pub struct Packet {
    pub msg_type_raw: u8,
    pub snapshot_id: SnapshotId,
    pub seq_num: SeqNum,
    pub timestamp_nanos: u64,
    pub pkt_id: PacketId,
    /// Exactly `payload_len` bytes; trailing bytes beyond that in the
    /// original buffer are ignored per spec §4.1.
    pub body: Bytes,
}

impl Packet {
    #[must_use]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type_raw)
    }
}

/// CRC32 over `header` (with its checksum field zeroed) concatenated with
/// `body`, matching spec §4.1 exactly.
#[must_use]
pub fn checksum(header_zeroed: &[u8; HEADER_LEN], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_zeroed);
    hasher.update(body);
    hasher.finalize()
}

/// Splits `body` into the bodies of the fragments that will carry it,
/// appending a trailing empty fragment if `body` is empty or its length is
/// an exact multiple of [`MAX_FRAGMENT_BODY`] — see `DESIGN.md` for why a
/// short (or empty) terminal fragment is how completeness is recognized by
/// [`crate::reassembly::Reassembler`], since the header carries no explicit
/// total-length or more-fragments field.
fn fragment_bodies(body: &[u8]) -> Vec<&[u8]> {
    if body.is_empty() {
        return vec![&[]];
    }
    let mut chunks: Vec<&[u8]> = body.chunks(MAX_FRAGMENT_BODY).collect();
    if chunks.last().is_some_and(|c| c.len() == MAX_FRAGMENT_BODY) {
        chunks.push(&[]);
    }
    chunks
}

/// Number of fragments [`encode_message`] will emit for a body of
/// `body_len` bytes, without doing the actual encoding. Callers that must
/// reserve a contiguous range of per-peer sequence numbers before encoding
/// (so every fragment gets a sequence slot atomically) use this to know
/// how many to reserve.
#[must_use]
pub fn fragment_count(body_len: usize) -> usize {
    if body_len == 0 {
        return 1;
    }
    let whole = body_len.div_ceil(MAX_FRAGMENT_BODY);
    if body_len % MAX_FRAGMENT_BODY == 0 {
        whole + 1
    } else {
        whole
    }
}

/// Encodes one logical message as an ordered list of fully-framed packets,
/// ready to be sent on the wire back-to-back. `start_seq` is the first
/// fragment's sequence number; fragments `i > 0` use `start_seq + i`.
///
/// Always returns at least one packet, even for an empty body (spec §4.1).
pub fn encode_message(
    msg_type: MsgType,
    pkt_id: PacketId,
    start_seq: SeqNum,
    snapshot_id: SnapshotId,
    timestamp_nanos: u64,
    body: &[u8],
) -> Vec<Vec<u8>> {
    let bodies = fragment_bodies(body);
    let mut packets = Vec::with_capacity(bodies.len());
    let mut seq = start_seq;
    for frag_body in bodies {
        debug_assert!(HEADER_LEN + frag_body.len() <= crate::header::MAX_PACKET_LEN);
        let header = PacketHeader {
            version: VERSION,
            msg_type: msg_type.as_u8(),
            snapshot_id,
            seq_num: seq,
            timestamp_nanos,
            payload_len: frag_body.len() as u16,
            pkt_id,
            checksum: 0,
        };
        let mut header_bytes = [0u8; HEADER_LEN];
        header.write_zeroed_checksum(&mut header_bytes);
        let sum = checksum(&header_bytes, frag_body);
        header_bytes[28..32].copy_from_slice(&sum.to_be_bytes());

        let mut packet = Vec::with_capacity(HEADER_LEN + frag_body.len());
        packet.extend_from_slice(&header_bytes);
        packet.extend_from_slice(frag_body);
        packets.push(packet);

        seq = seq.next();
    }
    packets
}

/// Encodes a single, unfragmented [`MsgType::TRANSPORT_ACK`] packet. Never
/// produced by [`encode_message`], which only frames real [`MsgType`]
/// variants — the transport-internal pseudo-type (wire value 255, outside
/// the sixteen-entry enum) needs its own one-off encoder (spec header
/// §4.1, `DESIGN.md`).
#[must_use]
pub fn encode_transport_ack_packet(pkt_id: PacketId, seq_num: SeqNum, timestamp_nanos: u64, body: &[u8]) -> Vec<u8> {
    debug_assert!(HEADER_LEN + body.len() <= crate::header::MAX_PACKET_LEN);
    let header = PacketHeader {
        version: VERSION,
        msg_type: MsgType::TRANSPORT_ACK,
        snapshot_id: SnapshotId::default(),
        seq_num,
        timestamp_nanos,
        payload_len: body.len() as u16,
        pkt_id,
        checksum: 0,
    };
    let mut header_bytes = [0u8; HEADER_LEN];
    header.write_zeroed_checksum(&mut header_bytes);
    let sum = checksum(&header_bytes, body);
    header_bytes[28..32].copy_from_slice(&sum.to_be_bytes());

    let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
    packet.extend_from_slice(&header_bytes);
    packet.extend_from_slice(body);
    packet
}

/// Decodes and integrity-checks a single packet. On any failure the packet
/// must be silently dropped by the caller (spec §4.1/§7) — no partial
/// decode is ever observable.
pub fn decode_packet(buf: &[u8]) -> Result<Packet, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TooShort);
    }
    let header_bytes: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
    if header_bytes[0..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let header = PacketHeader::parse_unchecked(&header_bytes);
    if header.version != VERSION {
        return Err(CodecError::BadVersion(header.version));
    }
    if MsgType::from_u8(header.msg_type).is_none() && header.msg_type != MsgType::TRANSPORT_ACK {
        return Err(CodecError::BadMsgType(header.msg_type));
    }

    let available = buf.len() - HEADER_LEN;
    let declared = header.payload_len as usize;
    if declared > available {
        return Err(CodecError::PayloadTruncated {
            declared: header.payload_len,
            available,
        });
    }
    let body = &buf[HEADER_LEN..HEADER_LEN + declared];

    let mut zeroed = header_bytes;
    zeroed[28..32].copy_from_slice(&[0; 4]);
    let expected = checksum(&zeroed, body);
    if expected != header.checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    Ok(Packet {
        msg_type_raw: header.msg_type,
        snapshot_id: header.snapshot_id,
        seq_num: header.seq_num,
        timestamp_nanos: header.timestamp_nanos,
        pkt_id: header.pkt_id,
        body: Bytes::copy_from_slice(body),
    })
}
