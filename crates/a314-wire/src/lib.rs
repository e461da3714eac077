#![deny(unsafe_code)]

//! Wire-level protocol definitions for the a314 bridge.
//!
//! Two protocols meet in the daemon and both are defined here:
//!
//! - the **ring protocol** spoken with the peer over the shared-memory
//!   rings ([`packet`]), and
//! - the **client protocol** spoken with local service providers over a
//!   stream socket ([`msg`]).
//!
//! The shared-memory geometry (ring sizes, control-area layout) and the
//! event/register numbering used by the interrupt path live at the crate
//! root, since both the transport and the daemon need them.

pub mod msg;
pub mod packet;

pub use msg::{MSG_FAIL, MSG_HEADER_LEN, MSG_SUCCESS, MessageHeader, MsgType, encode_message};
pub use packet::{
    CONNECT_OK, CONNECT_UNKNOWN_SERVICE, PKT_HEADER_LEN, Packet, PacketReader, PacketType,
    TruncatedPacket, encode_packet,
};

/// TCP port the daemon listens on.
pub const DAEMON_PORT: u16 = 7110;

/// Control-memory register map (16 registers, 4 bits each).
///
/// Registers 0..5 hold the base-address nibbles, little-nibble-first;
/// bit 0 of register 0 is the valid flag.
pub mod cmem {
    /// Number of nibble registers that jointly encode the base address.
    pub const BASE_ADDR_NIBBLES: u8 = 5;

    /// Peer→host pending events. Reading this register acknowledges the
    /// interrupt and clears the pending set.
    pub const R_EVENTS: u8 = 12;
    /// Peer→host event enable mask. Peer-owned; the daemon never writes it.
    pub const R_ENABLE: u8 = 13;
    /// Host→peer event mailbox.
    pub const A_EVENTS: u8 = 14;
    /// Host→peer event enable mask. Peer-owned.
    pub const A_ENABLE: u8 = 15;
}

/// Event bits raised by the peer, delivered through the interrupt line and
/// read back from [`cmem::R_EVENTS`].
pub mod peer_event {
    /// The peer appended data to the A2R ring.
    pub const A2R_TAIL: u8 = 1;
    /// The peer consumed data from the R2A ring.
    pub const R2A_HEAD: u8 = 2;
    /// The peer (re)published the base address.
    pub const BASE_ADDRESS: u8 = 4;
}

/// Event bits raised by the host, written to [`cmem::A_EVENTS`].
pub mod host_event {
    /// The host appended data to the R2A ring.
    pub const R2A_TAIL: u8 = 1;
    /// The host consumed data from the A2R ring.
    pub const A2R_HEAD: u8 = 2;
}

/// Byte offsets of the four ring indices in the control area at the base
/// address.
pub mod status {
    pub const A2R_TAIL: usize = 0;
    pub const R2A_HEAD: usize = 1;
    pub const R2A_TAIL: usize = 2;
    pub const A2R_HEAD: usize = 3;
}

/// Size of the control area holding the four ring indices.
pub const STATUS_LEN: usize = 4;

/// Size of each ring in bytes.
pub const RING_LEN: usize = 256;

/// Usable ring capacity. One byte is sacrificed so that a full ring can be
/// told apart from an empty one.
pub const RING_CAPACITY: usize = RING_LEN - 1;

/// Offset of the A2R ring data relative to the base address.
pub const A2R_DATA_OFFSET: u32 = STATUS_LEN as u32;

/// Offset of the R2A ring data relative to the base address.
pub const R2A_DATA_OFFSET: u32 = (STATUS_LEN + RING_LEN) as u32;

/// Largest payload a single ring packet can carry and still fit in a ring.
pub const MAX_PKT_PAYLOAD: usize = RING_CAPACITY - PKT_HEADER_LEN;

/// Ring occupancy given the head and tail indices. Index arithmetic is
/// modulo 256, which `u8` wrapping gives us for free.
#[inline]
pub const fn ring_used(head: u8, tail: u8) -> u8 {
    tail.wrapping_sub(head)
}

/// Free space in a ring given the head and tail indices.
#[inline]
pub const fn ring_free(head: u8, tail: u8) -> u8 {
    (RING_CAPACITY as u8) - ring_used(head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(A2R_DATA_OFFSET, 4);
        assert_eq!(R2A_DATA_OFFSET, 260);
        assert_eq!(RING_CAPACITY, 255);
        assert_eq!(MAX_PKT_PAYLOAD, 252);
    }

    #[test]
    fn ring_math_wraps() {
        assert_eq!(ring_used(0, 0), 0);
        assert_eq!(ring_used(10, 10), 0);
        assert_eq!(ring_used(0, 255), 255);
        // tail wrapped past zero, head still behind
        assert_eq!(ring_used(250, 3), 9);
        assert_eq!(ring_free(250, 3), 246);
        assert_eq!(ring_free(0, 255), 0);
    }
}
