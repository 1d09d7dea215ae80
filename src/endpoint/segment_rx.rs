use std::collections::BTreeMap;

//         next_seq
//         v
// ########________xxxx____xx__x-------> byte offsets
//
// #: consumed (fed to digest)
// x: buffered out of order
// _: missing

/// What happened to a received data segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The segment was consumed, along with any buffered segments it made contiguous.
    Delivered,
    /// The segment arrived ahead of a gap and was buffered.
    Buffered,
    /// The segment was already consumed or is already buffered.
    Duplicate,
}

/// Receive side of a transfer: reassembles the byte stream in order and digests it.
pub struct SegmentRx {
    next_seq: u32,
    // Received segments beyond next_seq, keyed by seq_num
    buffer: BTreeMap<u32, Box<[u8]>>,
    digest: md5::Context,
    byte_count: u64,
}

impl SegmentRx {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            buffer: BTreeMap::new(),
            digest: md5::Context::new(),
            byte_count: 0,
        }
    }

    /// Cumulative ack value: the next byte offset expected.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    #[cfg(test)]
    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    fn consume(&mut self, payload: &[u8]) {
        self.digest.consume(payload);
        self.next_seq = self.next_seq.wrapping_add(payload.len() as u32);
        self.byte_count += payload.len() as u64;
    }

    fn drain(&mut self) {
        while let Some(entry) = self.buffer.first_entry() {
            let seq_num = *entry.key();

            if seq_num == self.next_seq {
                let payload = entry.remove();
                self.consume(&payload);
            } else if seq_num < self.next_seq {
                // Covered by a longer segment delivered in the meantime
                entry.remove();
            } else {
                break;
            }
        }
    }

    pub fn receive(&mut self, seq_num: u32, payload: &[u8]) -> Disposition {
        if seq_num == self.next_seq {
            self.consume(payload);
            self.drain();
            return Disposition::Delivered;
        }

        if seq_num < self.next_seq || self.buffer.contains_key(&seq_num) {
            return Disposition::Duplicate;
        }

        self.buffer.insert(seq_num, payload.into());

        Disposition::Buffered
    }

    /// Returns the hex digest of everything consumed and resets for the next transfer.
    pub fn finish(&mut self) -> (String, u64) {
        let digest = std::mem::replace(&mut self.digest, md5::Context::new()).compute();
        let byte_count = self.byte_count;

        self.next_seq = 0;
        self.buffer.clear();
        self.byte_count = 0;

        (format!("{:x}", digest), byte_count)
    }
}

impl Default for SegmentRx {
    fn default() -> Self {
        Self::new()
    }
}
