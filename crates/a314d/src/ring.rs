//! Ring-buffer protocol state.
//!
//! Owns the daemon's view of the shared control area: the base address, the
//! four ring indices, and the host event bits accumulated during a tick.
//! The rings are only touched while a base address is held; every operation
//! here quietly no-ops otherwise.
//!
//! Publication order matters: ring data is written first, then the mutable
//! index pair, then the event nibble — the peer must never observe an index
//! advance before the bytes behind it.

use std::io;

use a314_transport::Bus;
use a314_wire::{
    A2R_DATA_OFFSET, R2A_DATA_OFFSET, RING_LEN, STATUS_LEN, cmem, host_event, ring_free,
    ring_used, status,
};

use crate::channel::Channels;

/// Shared-memory ring state, valid while a base address is held.
#[derive(Debug)]
pub struct RingState {
    base_address: Option<u32>,
    status: [u8; STATUS_LEN],
    /// Host event bits not yet published to the peer.
    pending: u8,
    scratch: Vec<u8>,
}

impl Default for RingState {
    fn default() -> Self {
        Self::new()
    }
}

impl RingState {
    pub fn new() -> Self {
        Self {
            base_address: None,
            status: [0; STATUS_LEN],
            pending: 0,
            scratch: Vec::with_capacity(RING_LEN),
        }
    }

    pub fn has_base(&self) -> bool {
        self.base_address.is_some()
    }

    pub fn base(&self) -> Option<u32> {
        self.base_address
    }

    /// Re-read the base address registers.
    ///
    /// The five nibbles are read twice; only two matching reads with the
    /// valid bit set are accepted, which guards against tearing while the
    /// peer rewrites them. On any other outcome the daemon holds no base
    /// address until the peer signals again.
    pub fn read_base_address<B: Bus>(&mut self, bus: &mut B) -> io::Result<()> {
        self.base_address = None;

        let first = read_base_registers(bus)?;
        if first & 1 == 0 {
            return Ok(());
        }
        let second = read_base_registers(bus)?;
        if first == second {
            let base = first & !1;
            tracing::info!(base = format_args!("{base:#x}"), "base address acquired");
            self.base_address = Some(base);
        } else {
            tracing::debug!("torn base address read ignored");
        }
        Ok(())
    }

    /// Refresh the four ring indices from the control area.
    pub fn read_status<B: Bus>(&mut self, bus: &mut B) -> io::Result<()> {
        let Some(base) = self.base_address else {
            return Ok(());
        };
        bus.read_mem(base, &mut self.status)?;
        self.pending = 0;
        Ok(())
    }

    /// Pull everything the peer has queued in the A2R ring.
    ///
    /// Returns the live region as one contiguous buffer (two bus reads if
    /// it wraps), advances the local head to the tail, and marks the
    /// `A2R_HEAD` event for publication.
    pub fn ingest_a2r<B: Bus>(&mut self, bus: &mut B) -> io::Result<Option<Vec<u8>>> {
        let Some(base) = self.base_address else {
            return Ok(None);
        };
        let head = self.status[status::A2R_HEAD];
        let tail = self.status[status::A2R_TAIL];
        let len = ring_used(head, tail) as usize;
        if len == 0 {
            return Ok(None);
        }

        let ring = base + A2R_DATA_OFFSET;
        let mut buf = vec![0u8; len];
        let at_end = RING_LEN - head as usize;
        if len <= at_end {
            bus.read_mem(ring + head as u32, &mut buf)?;
        } else {
            bus.read_mem(ring + head as u32, &mut buf[..at_end])?;
            bus.read_mem(ring, &mut buf[at_end..])?;
        }

        self.status[status::A2R_HEAD] = tail;
        self.pending |= host_event::A2R_HEAD;
        Ok(Some(buf))
    }

    /// Serialize as many queued packets as fit into the R2A ring.
    ///
    /// Draws from the send queue round-robin, stops when the head packet no
    /// longer fits, writes the batch (split in two if it crosses the ring
    /// end), advances the local tail, and marks the `R2A_TAIL` event.
    pub fn emit_r2a<B: Bus>(&mut self, bus: &mut B, channels: &mut Channels) -> io::Result<bool> {
        let Some(base) = self.base_address else {
            return Ok(false);
        };
        let head = self.status[status::R2A_HEAD];
        let mut tail = self.status[status::R2A_TAIL];
        let mut free = ring_free(head, tail) as usize;

        self.scratch.clear();
        while let Some((id, packet)) = channels.next_sendable(free) {
            free -= packet.wire_len();
            a314_wire::encode_packet(&mut self.scratch, packet.ptype, id, &packet.data);
        }
        if self.scratch.is_empty() {
            return Ok(false);
        }

        let ring = base + R2A_DATA_OFFSET;
        let mut data: &[u8] = &self.scratch;
        let at_end = RING_LEN - tail as usize;
        if at_end < data.len() {
            bus.write_mem(ring + tail as u32, &data[..at_end])?;
            data = &data[at_end..];
            tail = 0;
        }
        bus.write_mem(ring + tail as u32, data)?;
        tail = tail.wrapping_add(data.len() as u8);

        self.status[status::R2A_TAIL] = tail;
        self.pending |= host_event::R2A_TAIL;
        Ok(true)
    }

    /// Publish accumulated mutations: the `(R2A_tail, A2R_head)` pair, then
    /// the event nibble. No-op when nothing changed.
    pub fn publish<B: Bus>(&mut self, bus: &mut B) -> io::Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let Some(base) = self.base_address else {
            self.pending = 0;
            return Ok(());
        };

        bus.write_mem(
            base + status::R2A_TAIL as u32,
            &self.status[status::R2A_TAIL..=status::A2R_HEAD],
        )?;
        bus.write_cmem(cmem::A_EVENTS, self.pending)?;
        self.pending = 0;
        Ok(())
    }
}

fn read_base_registers<B: Bus>(bus: &mut B) -> io::Result<u32> {
    let mut value = 0u32;
    for reg in 0..cmem::BASE_ADDR_NIBBLES {
        value |= (bus.read_cmem(reg)? as u32) << (reg * 4);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use a314_transport::{MemBus, MemPeer, mem_link};
    use a314_wire::{PacketReader, PacketType, RING_CAPACITY};
    use proptest::prelude::*;

    const BASE: u32 = 0x100;

    fn ring_with_base() -> (RingState, MemBus, MemPeer) {
        let (mut bus, _irq, peer) = mem_link(8192);
        peer.set_base_address(BASE);
        let mut ring = RingState::new();
        ring.read_base_address(&mut bus).unwrap();
        assert_eq!(ring.base(), Some(BASE));
        (ring, bus, peer)
    }

    #[test]
    fn invalid_bit_rejects_base() {
        let (mut bus, _irq, _peer) = mem_link(64);
        let mut ring = RingState::new();
        ring.read_base_address(&mut bus).unwrap();
        assert!(!ring.has_base());
    }

    #[test]
    fn torn_read_rejects_base() {
        let (mut bus, _irq, peer) = mem_link(64);
        peer.set_base_address_torn(0x100, 0x200);
        let mut ring = RingState::new();
        ring.read_base_address(&mut bus).unwrap();
        assert!(!ring.has_base());

        // the tear has passed; the next attempt sees a stable value
        ring.read_base_address(&mut bus).unwrap();
        assert_eq!(ring.base(), Some(0x200));
    }

    #[test]
    fn ingest_reassembles_a_wrapped_region() {
        let (mut ring, mut bus, peer) = ring_with_base();

        // park the indices so the pushed bytes cross the ring end
        peer.poke_mem(BASE + status::A2R_HEAD as u32, &[250]);
        peer.poke_mem(BASE + status::A2R_TAIL as u32, &[250]);
        let mut packet = Vec::new();
        a314_wire::encode_packet(&mut packet, PacketType::Data.wire(), 1, &[9; 10]);
        peer.push_a2r(BASE, &packet);

        ring.read_status(&mut bus).unwrap();
        let region = ring.ingest_a2r(&mut bus).unwrap().unwrap();
        assert_eq!(region, packet);

        // head caught up with tail
        assert!(ring.ingest_a2r(&mut bus).unwrap().is_none());
    }

    #[test]
    fn emit_splits_across_the_ring_end() {
        let (mut ring, mut bus, peer) = ring_with_base();

        // place the R2A indices near the end so the write wraps
        peer.poke_mem(BASE + status::R2A_HEAD as u32, &[250]);
        peer.poke_mem(BASE + status::R2A_TAIL as u32, &[250]);
        ring.read_status(&mut bus).unwrap();

        let mut channels = Channels::new();
        channels.insert_new(9);
        channels.enqueue(9, PacketType::Data.wire(), vec![7; 20]);
        assert!(ring.emit_r2a(&mut bus, &mut channels).unwrap());
        ring.publish(&mut bus).unwrap();

        let bytes = peer.take_r2a(BASE);
        let packets: Vec<_> = PacketReader::new(&bytes)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel_id, 9);
        assert_eq!(packets[0].payload, &[7; 20][..]);
    }

    #[tokio::test]
    async fn publish_writes_indices_before_events() {
        let (mut ring, mut bus, peer) = ring_with_base();
        ring.read_status(&mut bus).unwrap();

        let mut channels = Channels::new();
        channels.insert_new(2);
        channels.enqueue(2, PacketType::Eos.wire(), Vec::new());
        ring.emit_r2a(&mut bus, &mut channels).unwrap();
        ring.publish(&mut bus).unwrap();

        // by the time the event bits are visible, the tail index and the
        // data behind it are already persisted
        assert_eq!(peer.host_events().await & host_event::R2A_TAIL, 1);
        let tail = peer.peek_mem(BASE + status::R2A_TAIL as u32, 1)[0];
        assert_eq!(tail, 3);
        assert_eq!(peer.peek_mem(BASE + R2A_DATA_OFFSET, 3), vec![
            0,
            PacketType::Eos.wire(),
            2
        ]);
    }

    #[test]
    fn emission_respects_free_space() {
        let (mut ring, mut bus, peer) = ring_with_base();

        // peer has consumed nothing and the ring already holds 200 bytes
        peer.poke_mem(BASE + status::R2A_HEAD as u32, &[0]);
        peer.poke_mem(BASE + status::R2A_TAIL as u32, &[200]);
        ring.read_status(&mut bus).unwrap();

        let mut channels = Channels::new();
        channels.insert_new(1);
        channels.enqueue(1, PacketType::Data.wire(), vec![0; 40]); // fits: 43 ≤ 55
        channels.enqueue(1, PacketType::Data.wire(), vec![0; 40]); // does not fit
        assert!(ring.emit_r2a(&mut bus, &mut channels).unwrap());
        ring.publish(&mut bus).unwrap();

        let tail = peer.peek_mem(BASE + status::R2A_TAIL as u32, 1)[0];
        assert_eq!(tail, 243);
        let emitted = peer.peek_r2a_region(BASE, 200, 3);
        assert_eq!(emitted, vec![40, PacketType::Data.wire(), 1]);
        // the second packet is still queued
        assert_eq!(channels.get(1).unwrap().queued_packets(), 1);
    }

    proptest! {
        /// Whatever the starting indices and packet mix, emission never
        /// overfills the ring and the peer reads back exactly what was
        /// queued, in order.
        #[test]
        fn emitted_bytes_roundtrip(
            start in 0u8..=255,
            used in 0u8..200,
            payload_lens in proptest::collection::vec(0usize..60, 1..8),
        ) {
            let (mut ring, mut bus, peer) = ring_with_base();
            let head = start;
            let tail = start.wrapping_add(used);
            peer.poke_mem(BASE + status::R2A_HEAD as u32, &[head]);
            peer.poke_mem(BASE + status::R2A_TAIL as u32, &[tail]);
            ring.read_status(&mut bus).unwrap();

            let mut channels = Channels::new();
            let mut expected = Vec::new();
            let mut free = ring_free(head, tail) as usize;
            let mut blocked = false;
            for (i, &len) in payload_lens.iter().enumerate() {
                let id = i as u8;
                channels.insert_new(id);
                channels.enqueue(id, PacketType::Data.wire(), vec![id; len]);
                // single packet per channel: round-robin order is queue order
                if !blocked && len + 3 <= free {
                    a314_wire::encode_packet(&mut expected, PacketType::Data.wire(), id, &vec![id; len]);
                    free -= len + 3;
                } else {
                    blocked = true;
                }
            }

            ring.emit_r2a(&mut bus, &mut channels).unwrap();
            let new_tail = tail.wrapping_add(expected.len() as u8);
            // tail only moves by what was emitted, never past capacity
            prop_assert!(ring_used(head, new_tail) as usize <= RING_CAPACITY);
            let bytes = peer.peek_r2a_region(BASE, tail, expected.len());
            prop_assert_eq!(bytes, expected);
        }
    }
}
