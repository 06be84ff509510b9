//! The client to master protocol.
//!
//! Every record on the control socket is exactly [`PACKET_SIZE`] bytes: a
//! type byte, a length byte and a payload the size of the platform's
//! `winsize`. The payload is either raw keyboard bytes (PUSH) or a window
//! size (WINCH/REDRAW), both ends agreeing on the native `u16` layout.
//!
//! The master to client direction is an unframed byte stream of program
//! output; there is nothing to decode on that side.

use std::mem::size_of;

use nix::pty::Winsize;
use strum::FromRepr;

use crate::cli::options::RedrawMethod;

pub const PAYLOAD_SIZE: usize = size_of::<Winsize>();
pub const PACKET_SIZE: usize = 2 + PAYLOAD_SIZE;

// The winsize overlay below spells out the four u16 fields.
const _: () = assert!(PAYLOAD_SIZE == 8);

/// Size of the buffer used for the master to client text stream.
pub const BUFSIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum PacketKind {
  Push = 0,
  Attach = 1,
  Detach = 2,
  Winch = 3,
  Redraw = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
  pub kind: PacketKind,
  /// Payload byte count for PUSH, redraw method for REDRAW, unused otherwise.
  pub len: u8,
  pub payload: [u8; PAYLOAD_SIZE],
}

impl Packet {
  pub fn attach() -> Self {
    Self {
      kind: PacketKind::Attach,
      len: 0,
      payload: [0; PAYLOAD_SIZE],
    }
  }

  pub fn detach() -> Self {
    Self {
      kind: PacketKind::Detach,
      len: 0,
      payload: [0; PAYLOAD_SIZE],
    }
  }

  /// `data` must fit in the payload; the attach client reads keyboard input
  /// in payload-sized chunks so this holds by construction.
  pub fn push(data: &[u8]) -> Self {
    debug_assert!(data.len() <= PAYLOAD_SIZE);
    let mut payload = [0; PAYLOAD_SIZE];
    payload[..data.len()].copy_from_slice(data);
    Self {
      kind: PacketKind::Push,
      len: data.len() as u8,
      payload,
    }
  }

  pub fn winch(ws: &Winsize) -> Self {
    Self {
      kind: PacketKind::Winch,
      len: 0,
      payload: encode_winsize(ws),
    }
  }

  /// `method` is the redraw the client asks for; `None` leaves the choice to
  /// the session default configured on the master.
  pub fn redraw(method: Option<RedrawMethod>, ws: &Winsize) -> Self {
    Self {
      kind: PacketKind::Redraw,
      len: method.map_or(0, |m| m as u8),
      payload: encode_winsize(ws),
    }
  }

  pub fn encode(&self) -> [u8; PACKET_SIZE] {
    let mut out = [0; PACKET_SIZE];
    out[0] = self.kind as u8;
    out[1] = self.len;
    out[2..].copy_from_slice(&self.payload);
    out
  }

  /// Returns `None` for unknown packet types, which the master ignores.
  pub fn decode(raw: &[u8; PACKET_SIZE]) -> Option<Self> {
    let kind = PacketKind::from_repr(raw[0])?;
    let mut payload = [0; PAYLOAD_SIZE];
    payload.copy_from_slice(&raw[2..]);
    Some(Self {
      kind,
      len: raw[1],
      payload,
    })
  }

  pub fn winsize(&self) -> Winsize {
    decode_winsize(&self.payload)
  }
}

pub fn encode_winsize(ws: &Winsize) -> [u8; PAYLOAD_SIZE] {
  let mut out = [0; PAYLOAD_SIZE];
  out[0..2].copy_from_slice(&ws.ws_row.to_ne_bytes());
  out[2..4].copy_from_slice(&ws.ws_col.to_ne_bytes());
  out[4..6].copy_from_slice(&ws.ws_xpixel.to_ne_bytes());
  out[6..8].copy_from_slice(&ws.ws_ypixel.to_ne_bytes());
  out
}

pub fn decode_winsize(payload: &[u8; PAYLOAD_SIZE]) -> Winsize {
  let u16_at = |i: usize| u16::from_ne_bytes([payload[i], payload[i + 1]]);
  Winsize {
    ws_row: u16_at(0),
    ws_col: u16_at(2),
    ws_xpixel: u16_at(4),
    ws_ypixel: u16_at(6),
  }
}

#[cfg(test)]
mod tests {
  use rstest::rstest;

  use super::*;

  fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
      ws_row: rows,
      ws_col: cols,
      ws_xpixel: 0,
      ws_ypixel: 0,
    }
  }

  #[rstest]
  #[case(PacketKind::Push, 0)]
  #[case(PacketKind::Attach, 1)]
  #[case(PacketKind::Detach, 2)]
  #[case(PacketKind::Winch, 3)]
  #[case(PacketKind::Redraw, 4)]
  fn packet_kind_wire_values(#[case] kind: PacketKind, #[case] wire: u8) {
    assert_eq!(kind as u8, wire);
    assert_eq!(PacketKind::from_repr(wire), Some(kind));
  }

  #[test]
  fn unknown_type_is_rejected() {
    let mut raw = Packet::attach().encode();
    raw[0] = 5;
    assert_eq!(Packet::decode(&raw), None);
    raw[0] = 0xff;
    assert_eq!(Packet::decode(&raw), None);
  }

  #[test]
  fn push_roundtrip() {
    let pkt = Packet::push(b"hello");
    let decoded = Packet::decode(&pkt.encode()).unwrap();
    assert_eq!(decoded.kind, PacketKind::Push);
    assert_eq!(decoded.len, 5);
    assert_eq!(&decoded.payload[..5], b"hello");
    assert_eq!(&decoded.payload[5..], &[0, 0, 0]);
  }

  #[test]
  fn winsize_overlay_roundtrip() {
    let ws = Winsize {
      ws_row: 52,
      ws_col: 220,
      ws_xpixel: 1024,
      ws_ypixel: 768,
    };
    let pkt = Packet::winch(&ws);
    let back = Packet::decode(&pkt.encode()).unwrap().winsize();
    assert_eq!(back.ws_row, 52);
    assert_eq!(back.ws_col, 220);
    assert_eq!(back.ws_xpixel, 1024);
    assert_eq!(back.ws_ypixel, 768);
  }

  #[test]
  fn redraw_wire_method() {
    let ws = winsize(24, 80);
    assert_eq!(Packet::redraw(None, &ws).len, 0);
    assert_eq!(Packet::redraw(Some(RedrawMethod::None), &ws).len, 1);
    assert_eq!(Packet::redraw(Some(RedrawMethod::CtrlL), &ws).len, 2);
    assert_eq!(Packet::redraw(Some(RedrawMethod::Winch), &ws).len, 3);
  }

  #[test]
  fn packet_is_fixed_size() {
    assert_eq!(PACKET_SIZE, 10);
    assert_eq!(Packet::attach().encode().len(), PACKET_SIZE);
  }
}
