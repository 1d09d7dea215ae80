use super::segment::Segment;

pub mod cc;
pub mod passive;
pub mod segment_rx;
pub mod segment_tx;

pub use passive::{Passive, PassiveContext, PassiveState};
pub use segment_tx::SegmentTx;

/// Host side of the sending endpoint.
pub trait HostContext {
    // Called to transmit a segment to the remote host.
    fn send_segment(&mut self, segment: &Segment);

    // Called after every transmission of `seq_num`; replaces any timer already set for it
    fn set_rto_timer(&mut self, seq_num: u32);

    // Called once `seq_num` no longer needs retransmitting
    fn unset_rto_timer(&mut self, seq_num: u32);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    use std::collections::BTreeSet;

    /// Records everything the sender asks of its host.
    #[derive(Default)]
    pub struct MockHostContext {
        pub sent: Vec<Segment>,
        pub timers: BTreeSet<u32>,
    }

    impl MockHostContext {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take_sent(&mut self) -> Vec<Segment> {
            std::mem::take(&mut self.sent)
        }

        pub fn sent_seq_nums(&mut self) -> Vec<u32> {
            self.take_sent().iter().map(|s| s.seq_num).collect()
        }
    }

    impl HostContext for MockHostContext {
        fn send_segment(&mut self, segment: &Segment) {
            self.sent.push(segment.clone());
        }

        fn set_rto_timer(&mut self, seq_num: u32) {
            self.timers.insert(seq_num);
        }

        fn unset_rto_timer(&mut self, seq_num: u32) {
            self.timers.remove(&seq_num);
        }
    }
}
