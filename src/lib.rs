//! Sent-packet handling for a QUIC endpoint.
//!
//! This crate tracks every packet an endpoint has transmitted, processes
//! incoming acknowledgements, detects lost packets, drives retransmission,
//! maintains round-trip-time statistics, and gates outgoing traffic through a
//! pluggable congestion controller. It contains no I/O and no wire codec: the
//! packet packer above it produces [`Packet`]s and [`Frame`]s, the socket
//! layer below it carries the bytes, and the connection event loop owns the
//! alarm returned by [`SentPacketHandler::get_alarm_timeout`].
//!
//! The handler is a single-threaded state machine; one instance belongs to
//! exactly one connection and all calls are serialized by that connection's
//! event loop.

use std::time::Duration;

mod frame;
mod handler;
mod history;
mod packet;
mod rtt;

pub mod congestion;

pub use crate::frame::{AckFrame, AckRange, Frame, StopWaitingFrame, StreamFrame};
pub use crate::handler::{AckError, SendMode, SentPacketHandler};
pub use crate::packet::{EncryptionLevel, Packet, PacketType};
pub use crate::rtt::RttStats;

/// A QUIC packet number. Strictly monotonically increasing per sender; 0 is a
/// valid packet number.
pub type PacketNumber = u64;

/// A byte count, used for packet lengths, bytes in flight and congestion
/// windows.
pub type ByteCount = u64;

/// Maximum number of deliberately skipped packet numbers remembered for ACK
/// validation. Older entries are dropped first.
pub const MAX_TRACKED_SKIPPED_PACKETS: usize = 10;

/// Beyond this many outstanding retransmittable packets, only ACK-only
/// packets may be sent.
pub const MAX_OUTSTANDING_SENT_PACKETS: usize = 1000;

/// Beyond this many tracked packets (outstanding plus queued for
/// retransmission), nothing may be sent at all.
pub const MAX_TRACKED_SENT_PACKETS: usize = MAX_OUTSTANDING_SENT_PACKETS * 5 / 4;

/// Minimum pacing quantum. When the congestion controller asks for a shorter
/// pacing delay, the sender batches several packets per wakeup instead.
pub const MIN_PACING_DELAY: Duration = Duration::from_micros(100);

/// Packet-number reordering threshold for fast retransmit: a packet is
/// declared lost once this many later packets have been acknowledged.
pub const REORDERING_THRESHOLD: PacketNumber = 3;

pub(crate) const DEFAULT_RTO_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);
pub(crate) const MAX_RTO_TIMEOUT: Duration = Duration::from_secs(60);

/// Floor for the handshake retransmission timeout.
pub(crate) const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

/// Assumed RTT before the first sample has been taken.
pub(crate) const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// Timers are not scheduled below this granularity.
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Cap for `2^n` backoff exponents so repeated timeouts cannot overflow.
pub(crate) const MAX_BACKOFF_EXPONENT: u32 = 16;
