use std::time::Duration;

use bytes::Bytes;

use crate::{ByteCount, PacketNumber};

/// A QUIC frame, as handed to the sent-packet handler by the packet packer.
///
/// Loss and ACK processing only discriminate [`Frame::Ack`] and
/// [`Frame::StopWaiting`]; every other variant is treated uniformly as
/// retransmittable payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    Stream(StreamFrame),
    Ping,
    RstStream {
        stream_id: u64,
        error_code: u32,
        byte_offset: ByteCount,
    },
    WindowUpdate {
        stream_id: u64,
        byte_offset: ByteCount,
    },
    Blocked {
        stream_id: u64,
    },
    Goaway {
        error_code: u32,
        last_good_stream_id: u64,
    },
    ConnectionClose {
        error_code: u32,
        reason: String,
    },
}

impl Frame {
    /// Whether loss of this frame obligates the sender to retransmit it.
    ///
    /// ACK and STOP_WAITING frames are regenerated from current state when
    /// needed, never retransmitted verbatim.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::StopWaiting(_))
    }
}

/// An acknowledgement frame received from (or sent to) the peer.
///
/// `ranges` lists the acknowledged blocks in descending order; when it is
/// empty the frame acknowledges the single contiguous block
/// `lowest_acked..=largest_acked`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,
    pub lowest_acked: PacketNumber,
    pub delay_time: Duration,
    pub ranges: Vec<AckRange>,
}

/// A contiguous block of acknowledged packet numbers, `first..=last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub first: PacketNumber,
    pub last: PacketNumber,
}

impl AckFrame {
    /// An ACK for the single contiguous block `lowest..=largest`.
    pub fn new(lowest_acked: PacketNumber, largest_acked: PacketNumber) -> Self {
        Self {
            largest_acked,
            lowest_acked,
            delay_time: Duration::ZERO,
            ranges: Vec::new(),
        }
    }

    /// Build an ACK from acknowledged blocks, in any order.
    pub fn with_ranges(mut ranges: Vec<AckRange>) -> Self {
        debug_assert!(!ranges.is_empty());
        ranges.sort_by(|a, b| b.first.cmp(&a.first));
        let largest_acked = ranges.first().map_or(0, |r| r.last);
        let lowest_acked = ranges.last().map_or(0, |r| r.first);
        let ranges = if ranges.len() > 1 { ranges } else { Vec::new() };
        Self {
            largest_acked,
            lowest_acked,
            delay_time: Duration::ZERO,
            ranges,
        }
    }

    pub fn has_missing_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `pn` is covered by one of the acknowledged blocks.
    pub fn acks_packet(&self, pn: PacketNumber) -> bool {
        if pn < self.lowest_acked || pn > self.largest_acked {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|r| r.first <= pn && pn <= r.last)
    }

    /// The acknowledged blocks in descending order.
    pub fn blocks(&self) -> Vec<AckRange> {
        if self.ranges.is_empty() {
            vec![AckRange {
                first: self.lowest_acked,
                last: self.largest_acked,
            }]
        } else {
            self.ranges.clone()
        }
    }
}

/// Tells the peer not to wait for packets below `least_unacked` (legacy QUIC
/// versions only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopWaitingFrame {
    pub least_unacked: PacketNumber,
}

/// Application data carried on a stream. The payload is reference-counted so
/// a packet clone held in the retransmission queue stays cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: ByteCount,
    pub data: Bytes,
    pub fin: bool,
}
