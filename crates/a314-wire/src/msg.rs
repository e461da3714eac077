//! Client protocol messages.
//!
//! A message on the client socket is `[length u32][stream_id u32][type u8]`
//! followed by `length` payload bytes. All header fields are
//! little-endian; every supported host is little-endian, so this matches
//! the host byte order the protocol calls for.

/// Size of the fixed message header.
pub const MSG_HEADER_LEN: usize = 9;

/// Result byte for register/deregister responses.
pub const MSG_SUCCESS: u8 = 1;
pub const MSG_FAIL: u8 = 0;

/// Message types on the client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Register a service name; payload is the name.
    RegisterReq = 1,
    /// One-byte success/fail response on stream 0.
    RegisterRes = 2,
    /// Remove a registration owned by this client.
    DeregisterReq = 3,
    DeregisterRes = 4,
    /// Read peer memory: payload is `addr u32, len u32`.
    ReadMemReq = 5,
    /// The requested bytes.
    ReadMemRes = 6,
    /// Write peer memory: payload is `addr u32` followed by the data.
    WriteMemReq = 7,
    /// Empty acknowledgement.
    WriteMemRes = 8,
    /// A peer connect was routed to this client; payload is the name.
    Connect = 9,
    /// One-byte connect response code.
    ConnectResponse = 10,
    /// Opaque stream bytes.
    Data = 11,
    /// Half-close of the sender's direction.
    Eos = 12,
    /// Abrupt teardown of the stream.
    Reset = 13,
}

impl MsgType {
    /// Decode a wire byte. Returns `None` for unknown types.
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MsgType::RegisterReq),
            2 => Some(MsgType::RegisterRes),
            3 => Some(MsgType::DeregisterReq),
            4 => Some(MsgType::DeregisterRes),
            5 => Some(MsgType::ReadMemReq),
            6 => Some(MsgType::ReadMemRes),
            7 => Some(MsgType::WriteMemReq),
            8 => Some(MsgType::WriteMemRes),
            9 => Some(MsgType::Connect),
            10 => Some(MsgType::ConnectResponse),
            11 => Some(MsgType::Data),
            12 => Some(MsgType::Eos),
            13 => Some(MsgType::Reset),
            _ => None,
        }
    }

    pub const fn wire(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgType::RegisterReq => "register-req",
            MsgType::RegisterRes => "register-res",
            MsgType::DeregisterReq => "deregister-req",
            MsgType::DeregisterRes => "deregister-res",
            MsgType::ReadMemReq => "read-mem-req",
            MsgType::ReadMemRes => "read-mem-res",
            MsgType::WriteMemReq => "write-mem-req",
            MsgType::WriteMemRes => "write-mem-res",
            MsgType::Connect => "connect",
            MsgType::ConnectResponse => "connect-response",
            MsgType::Data => "data",
            MsgType::Eos => "eos",
            MsgType::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// The fixed header in front of every client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Stream the message belongs to; 0 for control messages.
    pub stream_id: u32,
    /// Raw message type byte.
    pub msg_type: u8,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; MSG_HEADER_LEN] {
        let mut buf = [0u8; MSG_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[8] = self.msg_type;
        buf
    }

    pub fn decode(buf: &[u8; MSG_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            msg_type: buf[8],
        }
    }
}

/// Build a complete framed message ready to be written to a client socket.
pub fn encode_message(msg_type: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        length: payload.len() as u32,
        stream_id,
        msg_type,
    };
    let mut buf = Vec::with_capacity(MSG_HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
