//      0               1               2               3
//      0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//     +---------------------------------------------------------------+
//   0 |                           reserved                            |
//     +---------------------------------------------------------------+
//   4 |                        sequence number                        |
//     +---------------------------------------------------------------+
//   8 |                     acknowledgment number                     |
//     +---------------+-------+-+-+-+-+-------------------------------+
//  12 |   reserved    | rsvd  |A|0|R|S|F|            window           |
//     |               |       |C| |S|Y|I|                             |
//     |               |       |K| |T|N|N|                             |
//     +---------------+-------+-+-+-+-+-------------------------------+
//  16 |           checksum            |           reserved            |
//     +-------------------------------+-------------------------------+
//  20 |                        payload ...                            |
//     +---------------------------------------------------------------+
//
// All integers are big-endian. The checksum covers the payload only.

use super::*;

const RESERVED_WORD_SIZE: usize = 4;
const RESERVED_TAIL_SIZE: usize = 2;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram of {0} bytes is shorter than the segment header")]
    TooShort(usize),
    #[error("payload of {0} bytes exceeds the maximum segment size")]
    TooLong(usize),
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),
    #[error("checksum mismatch (stored {stored:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buffer.get(self.bytes_read..self.bytes_read + N)?;
        self.bytes_read += N;
        bytes.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    pub fn skip(&mut self, count: usize) -> Option<()> {
        if self.buffer.len() - self.bytes_read < count {
            return None;
        }

        self.bytes_read += count;
        Some(())
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buffer[self.bytes_read..]
    }
}

pub struct Writer<'a> {
    buffer: &'a mut [u8],
    bytes_written: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        let end = self.bytes_written + bytes.len();
        self.buffer[self.bytes_written..end].copy_from_slice(bytes);
        self.bytes_written = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_zeros(&mut self, count: usize) {
        let end = self.bytes_written + count;
        self.buffer[self.bytes_written..end].fill(0);
        self.bytes_written = end;
    }
}

/// Internet checksum (RFC 1071): one's-complement sum of big-endian 16-bit words, carries folded
/// back in, complemented. An odd trailing byte is padded with zero on the right.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);

    for word in words.by_ref() {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold early so the accumulator can never overflow
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Writes `segment` into `dst` and returns the number of bytes written, or `None` if `dst` is too
/// small. The checksum is recomputed from the payload; the stored field is not trusted.
pub fn write(segment: &Segment, dst: &mut [u8]) -> Option<usize> {
    let size = HEADER_SIZE + segment.payload.len();

    if dst.len() < size {
        return None;
    }

    let mut wr = Writer::new(dst);

    wr.write_zeros(RESERVED_WORD_SIZE);
    wr.write_u32(segment.seq_num);
    wr.write_u32(segment.ack_num);
    wr.write_u8(0);
    wr.write_u8(segment.flags.to_byte());
    wr.write_u16(segment.window);
    wr.write_u16(checksum(&segment.payload));
    wr.write_zeros(RESERVED_TAIL_SIZE);

    debug_assert_eq!(wr.bytes_written(), HEADER_SIZE);

    wr.write_slice(&segment.payload);

    Some(wr.bytes_written())
}

pub fn write_boxed(segment: &Segment) -> Box<[u8]> {
    let mut buffer = vec![0; HEADER_SIZE + segment.payload.len()].into_boxed_slice();

    let size = write(segment, &mut buffer).expect("buffer sized for segment");
    debug_assert_eq!(size, buffer.len());

    buffer
}

/// Parses a datagram. Everything after the header is payload, so short final segments and pure
/// control segments need no explicit length field.
pub fn read(src: &[u8]) -> Result<Segment, DecodeError> {
    if src.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort(src.len()));
    }

    let payload_len = src.len() - HEADER_SIZE;

    if payload_len > MSS {
        return Err(DecodeError::TooLong(payload_len));
    }

    let mut rd = Reader::new(src);

    // The length check above guarantees every header read succeeds
    let header = (|| {
        rd.skip(RESERVED_WORD_SIZE)?;
        let seq_num = rd.read_u32()?;
        let ack_num = rd.read_u32()?;
        rd.skip(1)?;
        let flags_byte = rd.read_u8()?;
        let window = rd.read_u16()?;
        let checksum = rd.read_u16()?;
        rd.skip(RESERVED_TAIL_SIZE)?;
        Some((seq_num, ack_num, flags_byte, window, checksum))
    })();

    let Some((seq_num, ack_num, flags_byte, window, stored)) = header else {
        return Err(DecodeError::TooShort(src.len()));
    };

    let flags = Flags::from_byte(flags_byte).ok_or(DecodeError::ReservedFlags(flags_byte))?;

    let payload = rd.remaining_bytes();

    let computed = checksum(payload);
    if computed != stored {
        return Err(DecodeError::ChecksumMismatch { stored, computed });
    }

    Ok(Segment {
        seq_num,
        ack_num,
        flags,
        window,
        checksum: stored,
        payload: payload.into(),
    })
}
