//! The fixed 32-byte packet header shared by every message type.

use crate::ids::{PacketId, SeqNum, SnapshotId};

/// `ESP1` in ASCII.
pub const MAGIC: [u8; 4] = *b"ESP1";

/// Current and only supported wire version.
pub const VERSION: u8 = 1;

/// Size in bytes of [`PacketHeader`] on the wire.
pub const HEADER_LEN: usize = 32;

/// Maximum size in bytes of an entire packet (header + body) on the wire.
pub const MAX_PACKET_LEN: usize = 1200;

/// Maximum body bytes a single fragment can carry.
pub const MAX_FRAGMENT_BODY: usize = MAX_PACKET_LEN - HEADER_LEN;

/// The sixteen application message types, matching spec wire values exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Init = 0,
    InitAck = 1,
    CreateRoom = 2,
    CreateAck = 3,
    JoinRoom = 4,
    JoinAck = 5,
    LeaveRoom = 6,
    LeaveAck = 7,
    ListRooms = 8,
    ListRoomsAck = 9,
    Event = 10,
    Updates = 11,
    UpdatesAck = 12,
    Snapshot = 13,
    SnapshotAck = 14,
    Disconnect = 15,
}

impl MsgType {
    /// Transport-internal pseudo message used only by the reliability layer
    /// to acknowledge [`MsgType::InitAck`], [`MsgType::CreateAck`] and
    /// [`MsgType::ListRoomsAck`] (the three reliable 1:1 request/reply
    /// flows that have no dedicated `*_ACK` message of their own in the
    /// sixteen-entry enum). Its body is a single `acked_seq: u32`. See
    /// `DESIGN.md` for why this exists: never observed by application code,
    /// filtered out by [`crate::codec::decode_packet`] callers before
    /// dispatch.
    pub const TRANSPORT_ACK: u8 = 255;

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Init,
            1 => Self::InitAck,
            2 => Self::CreateRoom,
            3 => Self::CreateAck,
            4 => Self::JoinRoom,
            5 => Self::JoinAck,
            6 => Self::LeaveRoom,
            7 => Self::LeaveAck,
            8 => Self::ListRooms,
            9 => Self::ListRoomsAck,
            10 => Self::Event,
            11 => Self::Updates,
            12 => Self::UpdatesAck,
            13 => Self::Snapshot,
            14 => Self::SnapshotAck,
            15 => Self::Disconnect,
            _ => return None,
        })
    }

    /// Whether this message type is emitted via the reliability layer's
    /// tracked (ACK-or-retransmit) mode rather than K-redundant
    /// fire-and-forget. See spec §4.3/§4.5/§4.6.
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::InitAck | Self::CreateAck | Self::ListRoomsAck | Self::Updates | Self::Snapshot
        )
    }
}

/// The 32-byte fixed header preceding every fragment's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    /// `Err` only when decoding an unrecognized byte; kept as a raw byte so
    /// decode can still validate checksum/length before rejecting on type.
    pub msg_type: u8,
    pub snapshot_id: SnapshotId,
    pub seq_num: SeqNum,
    pub timestamp_nanos: u64,
    pub payload_len: u16,
    pub pkt_id: PacketId,
    pub checksum: u32,
}

impl PacketHeader {
    /// Writes this header (with `checksum` zeroed, per spec §4.1) into `out`.
    pub fn write_zeroed_checksum(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = self.version;
        out[5] = self.msg_type;
        out[6..10].copy_from_slice(&self.snapshot_id.0.to_be_bytes());
        out[10..14].copy_from_slice(&self.seq_num.0.to_be_bytes());
        out[14..22].copy_from_slice(&self.timestamp_nanos.to_be_bytes());
        out[22..24].copy_from_slice(&self.payload_len.to_be_bytes());
        out[24..28].copy_from_slice(&self.pkt_id.0.to_be_bytes());
        out[28..32].copy_from_slice(&[0; 4]);
    }

    /// Parses a header out of the first [`HEADER_LEN`] bytes of `buf`.
    /// Does not validate magic/version/checksum; see
    /// [`crate::codec::decode_packet`] for the full validated decode path.
    #[must_use]
    pub fn parse_unchecked(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[4],
            msg_type: buf[5],
            snapshot_id: SnapshotId(u32::from_be_bytes(buf[6..10].try_into().unwrap())),
            seq_num: SeqNum(u32::from_be_bytes(buf[10..14].try_into().unwrap())),
            timestamp_nanos: u64::from_be_bytes(buf[14..22].try_into().unwrap()),
            payload_len: u16::from_be_bytes(buf[22..24].try_into().unwrap()),
            pkt_id: PacketId(u32::from_be_bytes(buf[24..28].try_into().unwrap())),
            checksum: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_preserves_fields() {
        let header = PacketHeader {
            version: VERSION,
            msg_type: MsgType::Event.as_u8(),
            snapshot_id: SnapshotId(42),
            seq_num: SeqNum(7),
            timestamp_nanos: 123_456_789,
            payload_len: 5,
            pkt_id: PacketId(99),
            checksum: 0xDEAD_BEEF,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.write_zeroed_checksum(&mut buf);
        let parsed = PacketHeader::parse_unchecked(&buf);
        assert_eq!(parsed.version, header.version);
        assert_eq!(parsed.msg_type, header.msg_type);
        assert_eq!(parsed.snapshot_id, header.snapshot_id);
        assert_eq!(parsed.seq_num, header.seq_num);
        assert_eq!(parsed.timestamp_nanos, header.timestamp_nanos);
        assert_eq!(parsed.payload_len, header.payload_len);
        assert_eq!(parsed.pkt_id, header.pkt_id);
        assert_eq!(parsed.checksum, 0, "checksum field must be zeroed on write");
        assert_eq!(&buf[0..4], &MAGIC);
    }
}
