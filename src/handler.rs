use std::cmp;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::congestion::SendAlgorithm;
use crate::frame::{AckFrame, StopWaitingFrame};
use crate::history::PacketHistory;
use crate::packet::{EncryptionLevel, Packet};
use crate::rtt::RttStats;
use crate::{
    ByteCount, PacketNumber, DEFAULT_RTO_TIMEOUT, MAX_BACKOFF_EXPONENT,
    MAX_OUTSTANDING_SENT_PACKETS, MAX_RTO_TIMEOUT, MAX_TRACKED_SENT_PACKETS,
    MAX_TRACKED_SKIPPED_PACKETS, MIN_PACING_DELAY, MIN_RTO_TIMEOUT, MIN_TLP_TIMEOUT,
    REORDERING_THRESHOLD, TIMER_GRANULARITY,
};

/// Protocol violations detected while processing an ACK frame.
///
/// Each of these closes the connection: the caller encodes the error into a
/// CONNECTION_CLOSE frame. Duplicate and reordered ACKs are *not* errors and
/// are ignored silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    /// The ACK references a packet number that was never sent.
    #[error("InvalidAckData: Received an ACK for an unsent packet")]
    UnsentPacket,
    /// The ACK claims a packet number the sender deliberately skipped.
    #[error("InvalidAckData: Received an ACK for a skipped packet number")]
    SkippedPacket,
    /// The ACK arrived at a lower encryption level than the packet it acks.
    #[error("Received ACK with encryption level {ack_level} that acks a packet {packet_number} (encryption level {packet_level})")]
    EncryptionLevelMismatch {
        ack_level: EncryptionLevel,
        packet_number: PacketNumber,
        packet_level: EncryptionLevel,
    },
}

/// What the sender is currently allowed to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Too many packets are tracked; nothing may be sent.
    None,
    /// Congestion-limited: only ACK-only packets may be sent.
    Ack,
    /// Queued retransmissions must be sent before new data.
    Retransmission,
    /// Anything may be sent.
    Any,
}

/// Emits STOP_WAITING frames (legacy QUIC versions): the peer must not wait
/// for packets below `least_unacked`, either because everything below it was
/// acknowledged or because the data will arrive under a new packet number.
#[derive(Debug, Default)]
struct StopWaitingTracker {
    least_unacked: Option<PacketNumber>,
    last_emitted: Option<PacketNumber>,
}

impl StopWaitingTracker {
    fn received_ack(&mut self, largest_acked: PacketNumber) {
        if self.least_unacked.map_or(true, |lu| largest_acked + 1 > lu) {
            self.least_unacked = Some(largest_acked + 1);
        }
    }

    fn queued_retransmission(&mut self, pn: PacketNumber) {
        if self.least_unacked.map_or(true, |lu| pn + 1 > lu) {
            self.least_unacked = Some(pn + 1);
        }
    }

    fn frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        let least_unacked = self.least_unacked?;
        if !force && self.last_emitted == Some(least_unacked) {
            return None;
        }
        self.last_emitted = Some(least_unacked);
        Some(StopWaitingFrame { least_unacked })
    }
}

/// Tracks every packet the endpoint has transmitted, processes incoming
/// acknowledgements, detects losses, and drives retransmission.
///
/// One instance belongs to one connection; all calls are serialized by the
/// connection's event loop. The connection owns the single alarm reported by
/// [`get_alarm_timeout`](Self::get_alarm_timeout) and calls
/// [`on_alarm`](Self::on_alarm) when it fires.
pub struct SentPacketHandler {
    last_sent_packet_number: Option<PacketNumber>,
    last_sent_retransmittable_packet_time: Option<Instant>,
    last_sent_handshake_packet_time: Option<Instant>,

    largest_acked: Option<PacketNumber>,
    /// The highest packet number an ACK frame arrived in. ACKs carried in
    /// older packets are outdated and dropped.
    largest_received_packet_with_ack: Option<PacketNumber>,
    /// One above the `largest_acked` of the newest of our own ACK frames that
    /// the peer has confirmed receiving.
    lowest_packet_not_confirmed_acked: PacketNumber,

    bytes_in_flight: ByteCount,
    packet_history: PacketHistory,
    /// Packet numbers deliberately never used, for ACK validation.
    skipped_packets: Vec<PacketNumber>,
    retransmission_queue: VecDeque<Packet>,
    stop_waiting: StopWaitingTracker,

    /// When the earliest outstanding packet will be declared lost, if an ACK
    /// above it has already been received.
    loss_time: Option<Instant>,
    alarm: Option<Instant>,
    handshake_count: u32,
    rto_count: u32,
    handshake_complete: bool,

    rtt_stats: RttStats,
    congestion: Box<dyn SendAlgorithm>,
}

impl SentPacketHandler {
    pub fn new(congestion: Box<dyn SendAlgorithm>) -> Self {
        Self {
            last_sent_packet_number: None,
            last_sent_retransmittable_packet_time: None,
            last_sent_handshake_packet_time: None,
            largest_acked: None,
            largest_received_packet_with_ack: None,
            lowest_packet_not_confirmed_acked: 0,
            bytes_in_flight: 0,
            packet_history: PacketHistory::new(),
            skipped_packets: Vec::new(),
            retransmission_queue: VecDeque::new(),
            stop_waiting: StopWaitingTracker::default(),
            loss_time: None,
            alarm: None,
            handshake_count: 0,
            rto_count: 0,
            handshake_complete: false,
            rtt_stats: RttStats::new(),
            congestion,
        }
    }

    /// Register a freshly transmitted packet.
    ///
    /// Packet numbers must increase strictly monotonically across calls;
    /// numbers skipped in between are remembered for ACK validation.
    pub fn sent_packet(&mut self, mut packet: Packet) {
        self.track_skipped_packets(packet.packet_number);
        self.last_sent_packet_number = Some(packet.packet_number);

        if !packet.is_retransmittable() {
            // ACK-only packets are neither tracked nor counted in flight, so
            // congestion feedback is not throttled by congestion itself.
            self.congestion.on_packet_sent(
                packet.send_time,
                self.bytes_in_flight,
                packet.packet_number,
                packet.length,
                false,
            );
            return;
        }

        packet.largest_acked = packet.embedded_largest_acked();
        packet.included_in_bytes_in_flight = true;
        self.bytes_in_flight += packet.length;
        self.last_sent_retransmittable_packet_time = Some(packet.send_time);
        if packet.encryption_level.is_handshake() {
            self.last_sent_handshake_packet_time = Some(packet.send_time);
        }
        self.congestion.on_packet_sent(
            packet.send_time,
            self.bytes_in_flight,
            packet.packet_number,
            packet.length,
            true,
        );
        self.packet_history.insert(packet);
        self.update_alarm();
    }

    /// Register retransmissions of a previously sent packet.
    ///
    /// The new packets carry the original's retransmittable frames under new
    /// packet numbers. The original is kept in the history so a late ACK for
    /// it can still be credited, but it leaves bytes in flight: per
    /// retransmission chain at most one packet is ever counted there.
    pub fn sent_packets_as_retransmission(
        &mut self,
        packets: Vec<Packet>,
        retransmission_of: PacketNumber,
    ) {
        let pns: Vec<PacketNumber> = packets.iter().map(|p| p.packet_number).collect();
        if let Some(original) = self.packet_history.get_mut(retransmission_of) {
            original.cannot_be_retransmitted = true;
            original.retransmitted_as.extend_from_slice(&pns);
            if original.included_in_bytes_in_flight {
                original.included_in_bytes_in_flight = false;
                self.bytes_in_flight -= original.length;
            }
        }
        for mut packet in packets {
            packet.retransmission_of = Some(retransmission_of);
            self.sent_packet(packet);
        }
    }

    /// Process an ACK frame received in packet `ack_packet_number` at
    /// encryption level `encryption_level`.
    pub fn received_ack(
        &mut self,
        ack: &AckFrame,
        ack_packet_number: PacketNumber,
        encryption_level: EncryptionLevel,
        rcv_time: Instant,
    ) -> Result<(), AckError> {
        if self
            .last_sent_packet_number
            .map_or(true, |last| ack.largest_acked > last)
        {
            return Err(AckError::UnsentPacket);
        }
        // Duplicate and reordered ACKs are a normal consequence of packet
        // reordering, not an error.
        if self
            .largest_received_packet_with_ack
            .is_some_and(|largest| ack_packet_number <= largest)
        {
            return Ok(());
        }
        if self.skipped_packets.iter().any(|&pn| ack.acks_packet(pn)) {
            return Err(AckError::SkippedPacket);
        }
        if let Some((&pn, packet)) = self
            .packet_history
            .range(ack.lowest_acked..=ack.largest_acked)
            .find(|&(&pn, p)| ack.acks_packet(pn) && p.encryption_level > encryption_level)
        {
            return Err(AckError::EncryptionLevelMismatch {
                ack_level: encryption_level,
                packet_number: pn,
                packet_level: packet.encryption_level,
            });
        }

        self.largest_received_packet_with_ack = Some(ack_packet_number);
        if self.largest_acked.map_or(true, |la| ack.largest_acked > la) {
            self.largest_acked = Some(ack.largest_acked);
            self.stop_waiting.received_ack(ack.largest_acked);
        }

        // Take an RTT sample from the largest acked packet, if it is still
        // outstanding.
        if let Some(packet) = self.packet_history.get(ack.largest_acked) {
            self.rtt_stats.update(
                rcv_time.saturating_duration_since(packet.send_time),
                ack.delay_time,
                rcv_time,
            );
        }

        let acked: Vec<PacketNumber> = self
            .packet_history
            .range(ack.lowest_acked..=ack.largest_acked)
            .filter(|&(&pn, _)| ack.acks_packet(pn))
            .map(|(&pn, _)| pn)
            .collect();
        if !acked.is_empty() {
            trace!(
                largest_acked = ack.largest_acked,
                count = acked.len(),
                "processing ACK"
            );
            self.congestion.maybe_exit_slow_start();
            for pn in acked {
                self.handle_acked_packet(pn);
            }
            self.handshake_count = 0;
            self.rto_count = 0;
        }

        self.garbage_collect_skipped_packets();
        self.detect_lost_packets(rcv_time);
        self.update_alarm();
        Ok(())
    }

    /// The next packet to re-send, in the order losses were detected.
    ///
    /// The caller packs its retransmittable frames into one or more new
    /// packets and registers them with
    /// [`sent_packets_as_retransmission`](Self::sent_packets_as_retransmission).
    pub fn dequeue_packet_for_retransmission(&mut self) -> Option<Packet> {
        self.retransmission_queue.pop_front()
    }

    /// When the alarm should fire next, if anything is outstanding.
    pub fn get_alarm_timeout(&self) -> Option<Instant> {
        self.alarm
    }

    /// Handle the alarm: retransmit handshake packets, finish delayed loss
    /// detection, or declare a retransmission timeout, whichever is due.
    pub fn on_alarm(&mut self, now: Instant) {
        if !self.handshake_complete && self.packet_history.has_outstanding_handshake_packets() {
            debug!(
                handshake_count = self.handshake_count,
                "handshake retransmission alarm"
            );
            self.queue_handshake_packets_for_retransmission();
            self.handshake_count += 1;
        } else if self.loss_time.is_some() {
            self.detect_lost_packets(now);
        } else {
            debug!(rto_count = self.rto_count, "retransmission timeout");
            let retransmitted = self.queue_rtos();
            self.rto_count += 1;
            self.congestion.on_retransmission_timeout(retransmitted);
        }
        self.update_alarm();
    }

    /// What the sender is currently allowed to transmit.
    pub fn send_mode(&self) -> SendMode {
        let num_tracked = self.retransmission_queue.len() + self.packet_history.len();
        if num_tracked >= MAX_TRACKED_SENT_PACKETS {
            return SendMode::None;
        }
        // Retransmissions bypass the congestion window: their data already
        // occupied it once.
        if !self.retransmission_queue.is_empty() {
            return SendMode::Retransmission;
        }
        if self.bytes_in_flight >= self.congestion.get_congestion_window()
            || self.packet_history.len() >= MAX_OUTSTANDING_SENT_PACKETS
        {
            return SendMode::Ack;
        }
        SendMode::Any
    }

    /// How many packets the sender should transmit in one batch: more than
    /// one when the pacing delay is below the scheduling granularity.
    pub fn should_send_num_packets(&self) -> usize {
        let delay = self
            .congestion
            .time_until_send(&self.rtt_stats, self.bytes_in_flight);
        if delay.is_zero() || delay >= MIN_PACING_DELAY {
            return 1;
        }
        MIN_PACING_DELAY.as_nanos().div_ceil(delay.as_nanos()) as usize
    }

    /// The earliest time the next packet may be sent, according to pacing.
    /// `None` when nothing retransmittable has been sent yet.
    pub fn time_until_send(&self) -> Option<Instant> {
        let last = self.last_sent_retransmittable_packet_time?;
        let delay = self
            .congestion
            .time_until_send(&self.rtt_stats, self.bytes_in_flight);
        last.checked_add(delay)
    }

    /// A STOP_WAITING frame to include in the next packet, if the peer needs
    /// one. With `force`, the current frame is returned even if it was
    /// already emitted (retransmissions must always carry it).
    pub fn get_stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        self.stop_waiting.frame(force)
    }

    /// The number of bytes needed to encode `packet_number` in a packet
    /// header, given what the peer has acknowledged so far.
    pub fn get_packet_number_len(&self, packet_number: PacketNumber) -> usize {
        let least_unacked = self.largest_acked.map_or(0, |la| la + 1);
        debug_assert!(packet_number >= least_unacked);
        let diff = packet_number - least_unacked;
        if diff < 1 << 15 {
            2
        } else if diff < 1 << 31 {
            4
        } else {
            6
        }
    }

    /// Drop all packets below forward-secure encryption: once the handshake
    /// completes they will never be acknowledged or retransmitted.
    pub fn set_handshake_complete(&mut self) {
        debug!("handshake complete, dropping non-forward-secure packets");
        self.handshake_complete = true;
        self.retransmission_queue
            .retain(|p| p.encryption_level == EncryptionLevel::ForwardSecure);
        let handshake_pns: Vec<PacketNumber> = self
            .packet_history
            .iter()
            .filter(|&(_, p)| p.encryption_level.is_handshake())
            .map(|(&pn, _)| pn)
            .collect();
        for pn in handshake_pns {
            let packet = self
                .packet_history
                .remove(pn)
                .expect("handshake packet in history");
            if packet.included_in_bytes_in_flight {
                self.bytes_in_flight -= packet.length;
            }
        }
        self.update_alarm();
    }

    /// One above the `largest_acked` of the newest of our ACK frames the peer
    /// has confirmed; lets the receiver side prune its own ACK state.
    pub fn get_lowest_packet_not_confirmed_acked(&self) -> PacketNumber {
        self.lowest_packet_not_confirmed_acked
    }

    pub fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    pub fn rtt_stats(&self) -> &RttStats {
        &self.rtt_stats
    }

    fn track_skipped_packets(&mut self, pn: PacketNumber) {
        if let Some(last) = self.last_sent_packet_number {
            debug_assert!(pn > last, "packet numbers must increase");
            self.skipped_packets.extend(last + 1..pn);
            if self.skipped_packets.len() > MAX_TRACKED_SKIPPED_PACKETS {
                let excess = self.skipped_packets.len() - MAX_TRACKED_SKIPPED_PACKETS;
                self.skipped_packets.drain(..excess);
            }
        }
    }

    fn garbage_collect_skipped_packets(&mut self) {
        if let Some(la) = self.largest_acked {
            self.skipped_packets.retain(|&pn| pn > la);
        }
    }

    fn handle_acked_packet(&mut self, pn: PacketNumber) {
        let Some(packet) = self.packet_history.remove(pn) else {
            return;
        };
        // An acked retransmission confirms delivery of its original's data.
        if let Some(original_pn) = packet.retransmission_of {
            if let Some(original) = self.packet_history.remove(original_pn) {
                self.unlink_acked_packet(original, false);
            }
        }
        self.unlink_acked_packet(packet, true);
    }

    fn unlink_acked_packet(&mut self, packet: Packet, directly_acked: bool) {
        if packet.included_in_bytes_in_flight {
            debug_assert!(self.bytes_in_flight >= packet.length);
            self.bytes_in_flight -= packet.length;
            // Acks of retransmissions don't feed congestion control: the
            // chain was already accounted for when the original was lost.
            if directly_acked && !packet.is_retransmission() {
                self.congestion.on_packet_acked(
                    packet.packet_number,
                    packet.length,
                    self.bytes_in_flight,
                );
            }
        }
        // The peer has the data; no descendant may be retransmitted again.
        for &descendant in &packet.retransmitted_as {
            if let Some(d) = self.packet_history.get_mut(descendant) {
                d.cannot_be_retransmitted = true;
            }
        }
        if let Some(largest_acked) = packet.largest_acked {
            self.lowest_packet_not_confirmed_acked = self
                .lowest_packet_not_confirmed_acked
                .max(largest_acked + 1);
        }
    }

    fn detect_lost_packets(&mut self, now: Instant) {
        self.loss_time = None;
        let Some(largest_acked) = self.largest_acked else {
            return;
        };
        let max_rtt = self.rtt_stats.max_rtt();
        let delay_until_lost = cmp::max(max_rtt + max_rtt / 8, TIMER_GRANULARITY);

        let mut lost = Vec::new();
        for (&pn, packet) in self.packet_history.iter() {
            if pn >= largest_acked {
                break;
            }
            if packet.send_time + delay_until_lost < now
                || pn + REORDERING_THRESHOLD <= largest_acked
            {
                lost.push(pn);
            } else {
                // Not lost yet: eligible once its loss delay expires.
                self.loss_time = Some(packet.send_time + delay_until_lost);
                break;
            }
        }
        if lost.is_empty() {
            return;
        }
        trace!("packets lost: {:?}", lost);
        for pn in lost {
            let mut packet = self
                .packet_history
                .remove(pn)
                .expect("lost packet in history");
            if packet.included_in_bytes_in_flight {
                packet.included_in_bytes_in_flight = false;
                debug_assert!(self.bytes_in_flight >= packet.length);
                self.bytes_in_flight -= packet.length;
                self.congestion
                    .on_packet_lost(pn, packet.length, self.bytes_in_flight);
            }
            if !packet.cannot_be_retransmitted {
                packet.cannot_be_retransmitted = true;
                self.enqueue_retransmission(packet);
            }
        }
    }

    /// Queue a packet that stays in the history (handshake or RTO
    /// retransmission; the test helpers use it for simulated losses).
    fn queue_for_retransmission(&mut self, pn: PacketNumber) {
        let clone = {
            let packet = self
                .packet_history
                .get_mut(pn)
                .expect("queued packet in history");
            debug_assert!(!packet.cannot_be_retransmitted);
            packet.cannot_be_retransmitted = true;
            packet.clone()
        };
        self.enqueue_retransmission(clone);
    }

    fn enqueue_retransmission(&mut self, packet: Packet) {
        self.stop_waiting.queued_retransmission(packet.packet_number);
        self.retransmission_queue.push_back(packet);
    }

    fn queue_handshake_packets_for_retransmission(&mut self) {
        let pns: Vec<PacketNumber> = self
            .packet_history
            .iter()
            .filter(|&(_, p)| p.encryption_level.is_handshake() && !p.cannot_be_retransmitted)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in pns {
            trace!(packet_number = pn, "queueing handshake packet for retransmission");
            self.queue_for_retransmission(pn);
        }
    }

    /// Queue the two most recent retransmittable packets. They leave bytes in
    /// flight immediately but stay in the history: if the RTO was spurious, a
    /// late ACK can still credit them.
    fn queue_rtos(&mut self) -> bool {
        let mut pns: Vec<PacketNumber> = self
            .packet_history
            .iter()
            .rev()
            .filter(|&(_, p)| !p.cannot_be_retransmitted)
            .take(2)
            .map(|(&pn, _)| pn)
            .collect();
        pns.reverse();
        for &pn in &pns {
            trace!(packet_number = pn, "queueing packet for retransmission (RTO)");
            let packet = self
                .packet_history
                .get_mut(pn)
                .expect("RTO packet in history");
            if packet.included_in_bytes_in_flight {
                packet.included_in_bytes_in_flight = false;
                self.bytes_in_flight -= packet.length;
            }
            self.queue_for_retransmission(pn);
        }
        !pns.is_empty()
    }

    fn update_alarm(&mut self) {
        self.alarm = if self.packet_history.is_empty() {
            None
        } else if !self.handshake_complete
            && self.packet_history.has_outstanding_handshake_packets()
        {
            self.last_sent_handshake_packet_time
                .map(|t| t + self.handshake_timeout())
        } else if let Some(loss_time) = self.loss_time {
            Some(loss_time)
        } else {
            self.last_sent_retransmittable_packet_time
                .map(|t| t + self.rto_timeout())
        };
    }

    fn handshake_timeout(&self) -> Duration {
        cmp::max(2 * self.rtt_stats.smoothed_or_initial_rtt(), MIN_TLP_TIMEOUT)
            * 2u32.pow(self.handshake_count.min(MAX_BACKOFF_EXPONENT))
    }

    fn rto_timeout(&self) -> Duration {
        let mut rto = self.congestion.retransmission_delay(&self.rtt_stats);
        if rto.is_zero() {
            rto = DEFAULT_RTO_TIMEOUT;
        }
        rto.clamp(MIN_RTO_TIMEOUT, MAX_RTO_TIMEOUT)
            * 2u32.pow(self.rto_count.min(MAX_BACKOFF_EXPONENT))
    }
}
