//! Logic for controlling the rate at which data is sent.

use std::time::{Duration, Instant};

use crate::rtt::RttStats;
use crate::{ByteCount, PacketNumber};

mod reno;

pub use reno::{Reno, RenoConfig};

/// Common interface for congestion controllers.
///
/// The sent-packet handler owns one implementation per connection and drives
/// it with send, ACK, loss and timeout events; the controller answers with a
/// congestion window, a pacing delay and a retransmission delay.
pub trait SendAlgorithm: Send {
    /// A packet was handed to the socket. `bytes_in_flight` is the value
    /// after accounting for this packet.
    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        length: ByteCount,
        is_retransmittable: bool,
    );

    /// Invoked exactly once per processed ACK, before any
    /// [`on_packet_acked`](Self::on_packet_acked) call for that ACK.
    fn maybe_exit_slow_start(&mut self);

    /// A packet was newly acknowledged. `bytes_in_flight` is the value after
    /// the packet left it.
    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        length: ByteCount,
        bytes_in_flight: ByteCount,
    );

    /// A packet was declared lost. `bytes_in_flight` is the value after the
    /// packet left it.
    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        length: ByteCount,
        bytes_in_flight: ByteCount,
    );

    /// The retransmission timeout fired. `packets_retransmitted` is false
    /// when the alarm found nothing eligible to retransmit.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Pacing: how long the sender should wait, measured from the last
    /// retransmittable send, before transmitting another packet.
    fn time_until_send(&self, rtt: &RttStats, bytes_in_flight: ByteCount) -> Duration;

    /// Number of bytes that may be in flight.
    fn get_congestion_window(&self) -> ByteCount;

    /// Base retransmission timeout, before the handler applies its floor,
    /// ceiling and exponential backoff. Zero means "no estimate yet".
    fn retransmission_delay(&self, rtt: &RttStats) -> Duration;
}
