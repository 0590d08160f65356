use std::collections::btree_map::{Iter, Range};
use std::collections::BTreeMap;
use std::ops::RangeBounds;

use crate::packet::Packet;
use crate::PacketNumber;

/// Transmitted but not yet acknowledged packets, keyed by packet number.
///
/// Packet numbers increase strictly monotonically, so key order is send
/// order; iteration walks packets oldest-first. Callers that remove packets
/// while walking collect the affected numbers first and remove afterwards.
#[derive(Debug, Default)]
pub(crate) struct PacketHistory {
    packets: BTreeMap<PacketNumber, Packet>,
    /// Packets below forward-secure encryption currently in the history.
    outstanding_handshake_packets: usize,
}

impl PacketHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, packet: Packet) {
        if packet.encryption_level.is_handshake() {
            self.outstanding_handshake_packets += 1;
        }
        let prev = self.packets.insert(packet.packet_number, packet);
        debug_assert!(prev.is_none(), "packet number reused");
    }

    pub(crate) fn remove(&mut self, pn: PacketNumber) -> Option<Packet> {
        let packet = self.packets.remove(&pn)?;
        if packet.encryption_level.is_handshake() {
            self.outstanding_handshake_packets -= 1;
        }
        Some(packet)
    }

    pub(crate) fn get(&self, pn: PacketNumber) -> Option<&Packet> {
        self.packets.get(&pn)
    }

    pub(crate) fn get_mut(&mut self, pn: PacketNumber) -> Option<&mut Packet> {
        self.packets.get_mut(&pn)
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub(crate) fn iter(&self) -> Iter<'_, PacketNumber, Packet> {
        self.packets.iter()
    }

    pub(crate) fn range<R: RangeBounds<PacketNumber>>(
        &self,
        range: R,
    ) -> Range<'_, PacketNumber, Packet> {
        self.packets.range(range)
    }

    pub(crate) fn has_outstanding_handshake_packets(&self) -> bool {
        self.outstanding_handshake_packets > 0
    }
}
