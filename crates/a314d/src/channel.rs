//! Logical channels and the outbound send queue.
//!
//! A channel is a single full-duplex stream identified by a peer-assigned
//! 8-bit id. Channels with queued outbound packets sit in the send queue,
//! which is drained round-robin: one packet per channel per pass, so no
//! backlogged channel can starve the others.

use std::collections::{HashMap, VecDeque};

use a314_wire::PKT_HEADER_LEN;

use crate::client::ClientId;

/// The client-side binding of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub client: ClientId,
    pub stream_id: u32,
}

/// One queued outbound ring packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub ptype: u8,
    pub data: Vec<u8>,
}

impl OutboundPacket {
    /// Bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        PKT_HEADER_LEN + self.data.len()
    }
}

/// State of one logical channel.
#[derive(Debug, Default)]
pub struct Channel {
    pub association: Option<Association>,
    pub eos_from_peer: bool,
    pub eos_from_client: bool,
    packet_queue: VecDeque<OutboundPacket>,
}

impl Channel {
    pub fn queued_packets(&self) -> usize {
        self.packet_queue.len()
    }
}

/// All live channels plus the round-robin send queue.
///
/// A channel is in the send queue exactly when its packet queue is
/// non-empty, and then exactly once.
#[derive(Debug, Default)]
pub struct Channels {
    map: HashMap<u8, Channel>,
    send_queue: VecDeque<u8>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.map.contains_key(&id)
    }

    pub fn get(&self, id: u8) -> Option<&Channel> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.map.get_mut(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Create a fresh channel. The caller has already rejected duplicates.
    pub fn insert_new(&mut self, id: u8) {
        self.map.insert(id, Channel::default());
    }

    /// Bind the channel to a client stream.
    pub fn associate(&mut self, id: u8, association: Association) {
        if let Some(ch) = self.map.get_mut(&id) {
            ch.association = Some(association);
        }
    }

    /// Unbind the channel, returning the old association.
    pub fn disassociate(&mut self, id: u8) -> Option<Association> {
        self.map.get_mut(&id).and_then(|ch| ch.association.take())
    }

    /// Queue an outbound packet, entering the channel into the send queue
    /// if its queue was empty.
    pub fn enqueue(&mut self, id: u8, ptype: u8, data: Vec<u8>) {
        let Some(ch) = self.map.get_mut(&id) else {
            return;
        };
        if ch.packet_queue.is_empty() {
            self.send_queue.push_back(id);
        }
        ch.packet_queue.push_back(OutboundPacket { ptype, data });
    }

    /// Drop all queued packets for a channel, removing it from the send
    /// queue.
    pub fn clear_queue(&mut self, id: u8) {
        let Some(ch) = self.map.get_mut(&id) else {
            return;
        };
        if !ch.packet_queue.is_empty() {
            ch.packet_queue.clear();
            self.send_queue.retain(|&queued| queued != id);
        }
    }

    /// Destroy the channel if it is unassociated and has nothing left to
    /// send.
    pub fn collect(&mut self, id: u8) {
        let dead = self
            .map
            .get(&id)
            .is_some_and(|ch| ch.association.is_none() && ch.packet_queue.is_empty());
        if dead {
            self.map.remove(&id);
        }
    }

    /// Pop the next packet in round-robin order, provided its wire length
    /// fits `budget`.
    ///
    /// The head channel contributes one packet and is re-queued at the tail
    /// if it still has more; a drained channel is collected. When the head
    /// channel's next packet does not fit, emission stops for this pass —
    /// ring order is strict, so nothing overtakes it.
    pub fn next_sendable(&mut self, budget: usize) -> Option<(u8, OutboundPacket)> {
        let &id = self.send_queue.front()?;
        let ch = self.map.get_mut(&id)?;

        if ch.packet_queue.front()?.wire_len() > budget {
            return None;
        }
        let packet = ch.packet_queue.pop_front()?;
        let more_queued = !ch.packet_queue.is_empty();

        self.send_queue.pop_front();
        if more_queued {
            self.send_queue.push_back(id);
        } else {
            self.collect(id);
        }
        Some((id, packet))
    }

    /// Tear down every channel, returning the associations that need a
    /// reset notification. Queued packets are discarded.
    pub fn drain_all(&mut self) -> Vec<(u8, Association)> {
        self.send_queue.clear();
        self.map
            .drain()
            .filter_map(|(id, ch)| ch.association.map(|assoc| (id, assoc)))
            .collect()
    }

    /// How many times `id` appears in the send queue (invariant: 0 or 1,
    /// matching whether the packet queue is empty).
    pub fn send_queue_entries(&self, id: u8) -> usize {
        self.send_queue.iter().filter(|&&queued| queued == id).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a314_wire::PacketType;
    use proptest::prelude::*;

    fn assert_send_queue_invariant(channels: &Channels) {
        for id in 0..=u8::MAX {
            let expected = match channels.get(id) {
                Some(ch) if ch.queued_packets() > 0 => 1,
                _ => 0,
            };
            assert_eq!(channels.send_queue_entries(id), expected, "channel {id}");
        }
    }

    #[test]
    fn enqueue_enters_send_queue_once() {
        let mut channels = Channels::new();
        channels.insert_new(7);
        channels.enqueue(7, PacketType::Data.wire(), vec![1]);
        channels.enqueue(7, PacketType::Data.wire(), vec![2]);
        assert_eq!(channels.send_queue_entries(7), 1);
        assert_send_queue_invariant(&channels);
    }

    #[test]
    fn clear_queue_removes_from_send_queue() {
        let mut channels = Channels::new();
        channels.insert_new(7);
        channels.associate(7, Association {
            client: ClientId(1),
            stream_id: 1,
        });
        channels.enqueue(7, PacketType::Data.wire(), vec![1]);
        channels.clear_queue(7);
        assert_eq!(channels.send_queue_entries(7), 0);
        assert_send_queue_invariant(&channels);
    }

    #[test]
    fn collect_requires_unassociated_and_empty() {
        let mut channels = Channels::new();
        channels.insert_new(3);
        channels.associate(3, Association {
            client: ClientId(1),
            stream_id: 1,
        });
        channels.collect(3);
        assert!(channels.contains(3));

        channels.disassociate(3);
        channels.enqueue(3, PacketType::Reset.wire(), Vec::new());
        channels.collect(3);
        assert!(channels.contains(3));

        channels.clear_queue(3);
        channels.collect(3);
        assert!(!channels.contains(3));
    }

    #[test]
    fn drained_unassociated_channel_is_collected() {
        let mut channels = Channels::new();
        channels.insert_new(5);
        channels.enqueue(5, PacketType::ConnectResponse.wire(), vec![3]);
        let (id, pkt) = channels.next_sendable(usize::MAX).unwrap();
        assert_eq!(id, 5);
        assert_eq!(pkt.data, vec![3]);
        assert!(!channels.contains(5));
    }

    #[test]
    fn head_of_line_packet_that_does_not_fit_stops_the_pass() {
        let mut channels = Channels::new();
        channels.insert_new(1);
        channels.insert_new(2);
        channels.enqueue(1, PacketType::Data.wire(), vec![0; 100]);
        channels.enqueue(2, PacketType::Data.wire(), vec![0; 4]);
        // 103 bytes needed at the head, only 50 available
        assert!(channels.next_sendable(50).is_none());
        assert_eq!(channels.send_queue_entries(1), 1);
        assert_eq!(channels.send_queue_entries(2), 1);
    }

    #[test]
    fn round_robin_alternates_between_channels() {
        let mut channels = Channels::new();
        for id in [1u8, 2, 3] {
            channels.insert_new(id);
            channels.associate(id, Association {
                client: ClientId(0),
                stream_id: 1,
            });
            for n in 0..3 {
                channels.enqueue(id, PacketType::Data.wire(), vec![n]);
            }
        }

        let mut order = Vec::new();
        while let Some((id, _)) = channels.next_sendable(usize::MAX) {
            order.push(id);
        }
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
        assert_send_queue_invariant(&channels);
    }

    proptest! {
        /// Round-robin fairness: with N backlogged channels, any sustained
        /// flush gives each channel ⌊total/N⌋ ±1 packets.
        #[test]
        fn flush_is_fair(
            n_channels in 1u8..8,
            per_channel in 1usize..6,
            drawn in 1usize..40,
        ) {
            let mut channels = Channels::new();
            for id in 0..n_channels {
                channels.insert_new(id);
                channels.associate(id, Association { client: ClientId(0), stream_id: 1 });
                for _ in 0..per_channel {
                    channels.enqueue(id, 6, vec![0; 4]);
                }
            }

            let mut counts = vec![0usize; n_channels as usize];
            let mut total = 0;
            while total < drawn {
                match channels.next_sendable(usize::MAX) {
                    Some((id, _)) => {
                        counts[id as usize] += 1;
                        total += 1;
                    }
                    None => break,
                }
            }

            let max = counts.iter().copied().max().unwrap_or(0);
            let min = counts.iter().copied().min().unwrap_or(0);
            // as long as every channel still has backlog, counts may differ
            // by at most one
            if counts.iter().all(|&c| c < per_channel) {
                prop_assert!(max - min <= 1);
            }
        }

        /// The send-queue membership invariant holds under arbitrary
        /// enqueue / clear / pop interleavings.
        #[test]
        fn send_queue_invariant_holds(ops in proptest::collection::vec((0u8..4, 0u8..4), 0..64)) {
            let mut channels = Channels::new();
            for (op, id) in ops {
                match op {
                    0 => {
                        if !channels.contains(id) {
                            channels.insert_new(id);
                        }
                        channels.enqueue(id, 6, vec![id]);
                    }
                    1 => channels.clear_queue(id),
                    2 => { channels.next_sendable(usize::MAX); }
                    _ => channels.collect(id),
                }
                for probe in 0u8..4 {
                    let expected = match channels.get(probe) {
                        Some(ch) if ch.queued_packets() > 0 => 1,
                        _ => 0,
                    };
                    prop_assert_eq!(channels.send_queue_entries(probe), expected);
                }
            }
        }
    }
}
