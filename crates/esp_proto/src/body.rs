//! Typed encode/decode for every message body laid out in spec §6.
//!
//! Bodies are plain big-endian, no-padding byte layouts; this module is the
//! only place that knows their exact field order, so every other component
//! works with typed structs instead of raw byte offsets.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::ids::{LocalId, PlayerId, RoomId};

/// A room member as it appears in `JOIN_ACK`/`LEAVE_ACK` rosters:
/// `player_id(4) local_id(1) r(1) g(1) b(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub player_id: PlayerId,
    pub local_id: LocalId,
    pub color: (u8, u8, u8),
}

/// A room summary as it appears in `LIST_ROOMS_ACK`:
/// `room_id(1) player_count(1) name_len(1) name(name_len bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub player_count: u8,
    pub name: String,
}

/// `event_type` is currently always [`EVENT_TYPE_ACQUIRE`] — the protocol
/// has exactly one state-changing event kind (a cell acquisition). The
/// field is kept as a raw byte on the wire to leave room for future event
/// kinds without changing the body layout.
pub const EVENT_TYPE_ACQUIRE: u8 = 0;

/// One `(event_type, local_id, cell_idx)` tuple, as carried in both `EVENT`
/// and each entry of `UPDATES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEntry {
    pub event_type: u8,
    pub local_id: LocalId,
    pub cell_idx: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("body too short for this message type")]
    TooShort,
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, BodyError> {
    if buf.remaining() < 1 {
        return Err(BodyError::TooShort);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, BodyError> {
    if buf.remaining() < 2 {
        return Err(BodyError::TooShort);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, BodyError> {
    if buf.remaining() < 4 {
        return Err(BodyError::TooShort);
    }
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut impl Buf, n: usize) -> Result<Vec<u8>, BodyError> {
    if buf.remaining() < n {
        return Err(BodyError::TooShort);
    }
    let mut out = vec![0u8; n];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

// ---- INIT_ACK ----

pub fn encode_init_ack(seq: u32, player_id: PlayerId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(seq);
    buf.put_u32(player_id.0);
    buf.to_vec()
}

pub fn decode_init_ack(mut body: &[u8]) -> Result<(u32, PlayerId), BodyError> {
    let seq = get_u32(&mut body)?;
    let player_id = PlayerId(get_u32(&mut body)?);
    Ok((seq, player_id))
}

// ---- CREATE_ROOM ----

pub fn encode_create_room(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

pub fn decode_create_room(body: &[u8]) -> Result<String, BodyError> {
    String::from_utf8(body.to_vec()).map_err(|_| BodyError::InvalidUtf8)
}

// ---- CREATE_ACK ----

pub fn encode_create_ack(seq: u32, room_id: RoomId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(seq);
    buf.put_u8(room_id.0);
    buf.to_vec()
}

pub fn decode_create_ack(mut body: &[u8]) -> Result<(u32, RoomId), BodyError> {
    let seq = get_u32(&mut body)?;
    let room_id = RoomId(get_u8(&mut body)?);
    Ok((seq, room_id))
}

// ---- JOIN_ROOM ----

pub fn encode_join_room(room_id: RoomId) -> Vec<u8> {
    vec![room_id.0]
}

pub fn decode_join_room(mut body: &[u8]) -> Result<RoomId, BodyError> {
    Ok(RoomId(get_u8(&mut body)?))
}

// ---- JOIN_ACK ----

pub fn encode_join_ack(seq: u32, room_id: RoomId, your_local_id: LocalId, members: &[MemberInfo]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(7 + members.len() * 8);
    buf.put_u32(seq);
    buf.put_u8(room_id.0);
    buf.put_u8(your_local_id.0);
    buf.put_u8(members.len() as u8);
    for m in members {
        buf.put_u32(m.player_id.0);
        buf.put_u8(m.local_id.0);
        buf.put_u8(m.color.0);
        buf.put_u8(m.color.1);
        buf.put_u8(m.color.2);
    }
    buf.to_vec()
}

pub fn decode_join_ack(mut body: &[u8]) -> Result<(u32, RoomId, LocalId, Vec<MemberInfo>), BodyError> {
    let seq = get_u32(&mut body)?;
    let room_id = RoomId(get_u8(&mut body)?);
    let your_local_id = LocalId(get_u8(&mut body)?);
    let count = get_u8(&mut body)?;
    let members = decode_members(&mut body, count)?;
    Ok((seq, room_id, your_local_id, members))
}

// ---- LEAVE_ACK ----

pub fn encode_leave_ack(seq: u32, members: &[MemberInfo]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + members.len() * 8);
    buf.put_u32(seq);
    buf.put_u8(members.len() as u8);
    for m in members {
        buf.put_u32(m.player_id.0);
        buf.put_u8(m.local_id.0);
        buf.put_u8(m.color.0);
        buf.put_u8(m.color.1);
        buf.put_u8(m.color.2);
    }
    buf.to_vec()
}

pub fn decode_leave_ack(mut body: &[u8]) -> Result<(u32, Vec<MemberInfo>), BodyError> {
    let seq = get_u32(&mut body)?;
    let count = get_u8(&mut body)?;
    let members = decode_members(&mut body, count)?;
    Ok((seq, members))
}

fn decode_members(body: &mut &[u8], count: u8) -> Result<Vec<MemberInfo>, BodyError> {
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let player_id = PlayerId(get_u32(body)?);
        let local_id = LocalId(get_u8(body)?);
        let r = get_u8(body)?;
        let g = get_u8(body)?;
        let b = get_u8(body)?;
        members.push(MemberInfo {
            player_id,
            local_id,
            color: (r, g, b),
        });
    }
    Ok(members)
}

// ---- LIST_ROOMS_ACK ----

pub fn encode_list_rooms_ack(seq: u32, rooms: &[RoomSummary]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + rooms.len() * 4);
    buf.put_u32(seq);
    buf.put_u8(rooms.len() as u8);
    for room in rooms {
        buf.put_u8(room.room_id.0);
        buf.put_u8(room.player_count);
        let name_bytes = room.name.as_bytes();
        buf.put_u8(name_bytes.len() as u8);
        buf.put_slice(name_bytes);
    }
    buf.to_vec()
}

pub fn decode_list_rooms_ack(mut body: &[u8]) -> Result<(u32, Vec<RoomSummary>), BodyError> {
    let seq = get_u32(&mut body)?;
    let count = get_u8(&mut body)?;
    let mut rooms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let room_id = RoomId(get_u8(&mut body)?);
        let player_count = get_u8(&mut body)?;
        let name_len = get_u8(&mut body)? as usize;
        let name_bytes = get_bytes(&mut body, name_len)?;
        let name = String::from_utf8(name_bytes).map_err(|_| BodyError::InvalidUtf8)?;
        rooms.push(RoomSummary {
            room_id,
            player_count,
            name,
        });
    }
    Ok((seq, rooms))
}

// ---- EVENT ----

pub fn encode_event(event_type: u8, room_id: RoomId, local_id: LocalId, cell_idx: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(event_type);
    buf.put_u8(room_id.0);
    buf.put_u8(local_id.0);
    buf.put_u16(cell_idx);
    buf.to_vec()
}

pub fn decode_event(mut body: &[u8]) -> Result<(u8, RoomId, LocalId, u16), BodyError> {
    let event_type = get_u8(&mut body)?;
    let room_id = RoomId(get_u8(&mut body)?);
    let local_id = LocalId(get_u8(&mut body)?);
    let cell_idx = get_u16(&mut body)?;
    Ok((event_type, room_id, local_id, cell_idx))
}

// ---- UPDATES ----

pub fn encode_updates(entries: &[UpdateEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + entries.len() * 4);
    buf.put_u16(entries.len() as u16);
    for e in entries {
        buf.put_u8(e.event_type);
        buf.put_u8(e.local_id.0);
        buf.put_u16(e.cell_idx);
    }
    buf.to_vec()
}

pub fn decode_updates(mut body: &[u8]) -> Result<Vec<UpdateEntry>, BodyError> {
    let count = get_u16(&mut body)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let event_type = get_u8(&mut body)?;
        let local_id = LocalId(get_u8(&mut body)?);
        let cell_idx = get_u16(&mut body)?;
        entries.push(UpdateEntry {
            event_type,
            local_id,
            cell_idx,
        });
    }
    Ok(entries)
}

// ---- UPDATES_ACK / SNAPSHOT_ACK (identical layout) ----

pub fn encode_fragment_ack(seq: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(seq);
    buf.to_vec()
}

pub fn decode_fragment_ack(mut body: &[u8]) -> Result<u32, BodyError> {
    get_u32(&mut body)
}

// ---- SNAPSHOT ----

/// Number of cells in the grid (spec §3: "20x20").
pub const GRID_CELLS: usize = 400;

pub fn encode_snapshot(grid: &[u8; GRID_CELLS]) -> Vec<u8> {
    grid.to_vec()
}

pub fn decode_snapshot(body: &[u8]) -> Result<[u8; GRID_CELLS], BodyError> {
    if body.len() < GRID_CELLS {
        return Err(BodyError::TooShort);
    }
    let mut grid = [0u8; GRID_CELLS];
    grid.copy_from_slice(&body[..GRID_CELLS]);
    Ok(grid)
}

// ---- transport-internal ACK (MsgType::TRANSPORT_ACK) ----

pub fn encode_transport_ack(acked_seq: u32) -> Vec<u8> {
    encode_fragment_ack(acked_seq)
}

pub fn decode_transport_ack(body: &[u8]) -> Result<u32, BodyError> {
    decode_fragment_ack(body)
}
