pub mod serial;

use std::hash::{Hash, Hasher};

pub use serial::DecodeError;

/// Maximum number of payload bytes carried by a single segment.
pub const MSS: usize = 1000;

/// Size of the fixed segment header on the wire.
pub const HEADER_SIZE: usize = 20;

/// Largest datagram either peer will ever send.
pub const MTU: usize = MSS + HEADER_SIZE;

/// Control bits carried in the flags byte of the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub ack: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl Flags {
    pub const ACK_BIT: u8 = 0x10;
    pub const RST_BIT: u8 = 0x04;
    pub const SYN_BIT: u8 = 0x02;
    pub const FIN_BIT: u8 = 0x01;

    const ALL_BITS: u8 = Self::ACK_BIT | Self::RST_BIT | Self::SYN_BIT | Self::FIN_BIT;

    pub const NONE: Self = Self {
        ack: false,
        rst: false,
        syn: false,
        fin: false,
    };

    pub fn to_byte(&self) -> u8 {
        let mut byte = 0;

        if self.ack {
            byte |= Self::ACK_BIT;
        }
        if self.rst {
            byte |= Self::RST_BIT;
        }
        if self.syn {
            byte |= Self::SYN_BIT;
        }
        if self.fin {
            byte |= Self::FIN_BIT;
        }

        byte
    }

    /// Returns `None` if any reserved bit is set.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & !Self::ALL_BITS != 0 {
            return None;
        }

        Some(Self {
            ack: byte & Self::ACK_BIT != 0,
            rst: byte & Self::RST_BIT != 0,
            syn: byte & Self::SYN_BIT != 0,
            fin: byte & Self::FIN_BIT != 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// One unit of wire exchange.
///
/// Two segments compare equal when their sequence numbers match, regardless of any other field.
/// The sender relies on this to find the pending copy of a given byte offset.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Byte offset of the first payload byte, or a handshake/teardown control value.
    pub seq_num: u32,
    /// Next byte offset expected by the sender of this segment. Only meaningful with `ACK`.
    pub ack_num: u32,
    pub flags: Flags,
    /// Advertised receive window. Only meaningful with `ACK`.
    pub window: u16,
    /// Internet checksum of `payload`.
    pub checksum: u16,
    pub payload: Box<[u8]>,
}

impl Segment {
    fn new(seq_num: u32, ack_num: u32, flags: Flags, window: u16, payload: Box<[u8]>) -> Self {
        debug_assert!(payload.len() <= MSS);

        let checksum = serial::checksum(&payload);

        Self {
            seq_num,
            ack_num,
            flags,
            window,
            checksum,
            payload,
        }
    }

    pub fn syn(seq_num: u32) -> Self {
        let flags = Flags {
            syn: true,
            ..Flags::NONE
        };

        Self::new(seq_num, 0, flags, 0, Box::default())
    }

    pub fn syn_ack(seq_num: u32, ack_num: u32, window: u16) -> Self {
        let flags = Flags {
            syn: true,
            ack: true,
            ..Flags::NONE
        };

        Self::new(seq_num, ack_num, flags, window, Box::default())
    }

    pub fn ack(seq_num: u32, ack_num: u32, window: u16) -> Self {
        let flags = Flags {
            ack: true,
            ..Flags::NONE
        };

        Self::new(seq_num, ack_num, flags, window, Box::default())
    }

    pub fn fin(seq_num: u32) -> Self {
        let flags = Flags {
            fin: true,
            ..Flags::NONE
        };

        Self::new(seq_num, 0, flags, 0, Box::default())
    }

    pub fn data(seq_num: u32, payload: &[u8]) -> Self {
        Self::new(seq_num, 0, Flags::NONE, 0, payload.into())
    }

    pub fn payload_len(&self) -> u32 {
        // Bounded by MSS
        self.payload.len() as u32
    }

    /// Serializes this segment into a newly allocated datagram.
    pub fn encode(&self) -> Box<[u8]> {
        serial::write_boxed(self)
    }

    /// Parses a received datagram, rejecting it if the payload checksum does not match.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        serial::read(datagram)
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.seq_num == other.seq_num
    }
}

impl Eq for Segment {}

impl Hash for Segment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seq_num.hash(state);
    }
}
