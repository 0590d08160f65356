use std::fmt;
use std::time::Instant;

use crate::frame::Frame;
use crate::{ByteCount, PacketNumber};

/// The type of a sent packet, as chosen by the packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

/// Protection state of a packet. The variants are totally ordered: a packet
/// may only be acknowledged at its own encryption level or higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Unencrypted,
    Secure,
    ForwardSecure,
}

impl EncryptionLevel {
    /// Whether packets at this level belong to the handshake timeline.
    pub fn is_handshake(self) -> bool {
        self < Self::ForwardSecure
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Unencrypted => "unencrypted",
            Self::Secure => "encrypted (not forward-secure)",
            Self::ForwardSecure => "forward-secure",
        })
    }
}

/// A sent packet tracked by the handler while it is in flight.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_number: PacketNumber,
    pub packet_type: PacketType,
    pub frames: Vec<Frame>,
    /// On-wire size of the packet, QUIC framing included, UDP/IP excluded.
    pub length: ByteCount,
    pub encryption_level: EncryptionLevel,
    pub send_time: Instant,

    /// If the packet carried an ACK frame, the `largest_acked` of that ACK.
    pub(crate) largest_acked: Option<PacketNumber>,
    /// Set when the packet has already been retransmitted, or when it is a
    /// retransmission whose original was acknowledged.
    pub(crate) cannot_be_retransmitted: bool,
    pub(crate) included_in_bytes_in_flight: bool,
    /// Packet numbers of the retransmissions that replaced this packet.
    pub(crate) retransmitted_as: Vec<PacketNumber>,
    /// The original this packet retransmits, if it is a retransmission.
    pub(crate) retransmission_of: Option<PacketNumber>,
}

impl Packet {
    pub fn new(
        packet_number: PacketNumber,
        packet_type: PacketType,
        frames: Vec<Frame>,
        length: ByteCount,
        encryption_level: EncryptionLevel,
        send_time: Instant,
    ) -> Self {
        Self {
            packet_number,
            packet_type,
            frames,
            length,
            encryption_level,
            send_time,
            largest_acked: None,
            cannot_be_retransmitted: false,
            included_in_bytes_in_flight: false,
            retransmitted_as: Vec::new(),
            retransmission_of: None,
        }
    }

    /// Whether the packet contains any frame that obligates retransmission.
    pub fn is_retransmittable(&self) -> bool {
        self.frames.iter().any(Frame::is_retransmittable)
    }

    pub fn is_retransmission(&self) -> bool {
        self.retransmission_of.is_some()
    }

    /// The frames to carry in a retransmission of this packet. ACK and
    /// STOP_WAITING frames are dropped; the packer regenerates those from
    /// current state.
    pub fn frames_for_retransmission(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.is_retransmittable())
            .cloned()
            .collect()
    }

    /// The `largest_acked` of an ACK frame embedded in this packet, if any.
    pub(crate) fn embedded_largest_acked(&self) -> Option<PacketNumber> {
        self.frames.iter().find_map(|f| match f {
            Frame::Ack(ack) => Some(ack.largest_acked),
            _ => None,
        })
    }
}
