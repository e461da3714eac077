//! Ring packet framing.
//!
//! Packets travel back-to-back in the A2R and R2A rings as
//! `[plen u8][ptype u8][channel_id u8][payload plen bytes]`. The frame is
//! self-describing, so a contiguous scratch copy of a ring region can be
//! parsed without any out-of-band length information.

/// Bytes of framing in front of every ring packet payload.
pub const PKT_HEADER_LEN: usize = 3;

/// Packet types carried on the rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Peer opens a logical channel; payload is the service name.
    Connect = 4,
    /// One-byte response code for a connect.
    ConnectResponse = 5,
    /// Opaque stream bytes.
    Data = 6,
    /// Half-close of the sender's direction.
    Eos = 7,
    /// Abrupt teardown of the channel.
    Reset = 8,
}

impl PacketType {
    /// Decode a wire byte. Returns `None` for unknown types.
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            4 => Some(PacketType::Connect),
            5 => Some(PacketType::ConnectResponse),
            6 => Some(PacketType::Data),
            7 => Some(PacketType::Eos),
            8 => Some(PacketType::Reset),
            _ => None,
        }
    }

    pub const fn wire(self) -> u8 {
        self as u8
    }
}

/// Connect succeeded.
pub const CONNECT_OK: u8 = 0;
/// No service with the requested name is registered.
pub const CONNECT_UNKNOWN_SERVICE: u8 = 3;

/// A packet borrowed from a scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub ptype: u8,
    pub channel_id: u8,
    pub payload: &'a [u8],
}

/// A packet frame ran past the end of the received region.
///
/// The rings only ever hold whole packets, so this means the peer's framing
/// state is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncatedPacket {
    /// Offset of the offending packet header in the scratch buffer.
    pub at: usize,
}

impl std::fmt::Display for TruncatedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "truncated ring packet at offset {}", self.at)
    }
}

impl std::error::Error for TruncatedPacket {}

/// Iterator over the packets in a contiguous ring region.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for PacketReader<'a> {
    type Item = Result<Packet<'a>, TruncatedPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.buf.len() {
            return None;
        }
        let at = self.pos;
        if self.buf.len() - at < PKT_HEADER_LEN {
            self.pos = self.buf.len();
            return Some(Err(TruncatedPacket { at }));
        }
        let plen = self.buf[at] as usize;
        let end = at + PKT_HEADER_LEN + plen;
        if end > self.buf.len() {
            self.pos = self.buf.len();
            return Some(Err(TruncatedPacket { at }));
        }
        self.pos = end;
        Some(Ok(Packet {
            ptype: self.buf[at + 1],
            channel_id: self.buf[at + 2],
            payload: &self.buf[at + PKT_HEADER_LEN..end],
        }))
    }
}

/// Append one framed packet to `out`.
///
/// The payload length must fit the one-byte length field; callers enforce
/// the tighter ring-capacity bound.
pub fn encode_packet(out: &mut Vec<u8>, ptype: u8, channel_id: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= u8::MAX as usize);
    out.push(payload.len() as u8);
    out.push(ptype);
    out.push(channel_id);
    out.extend_from_slice(payload);
}
