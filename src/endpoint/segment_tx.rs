use std::collections::BTreeMap;
use std::io::{self, Read};

use super::cc::{AckKind, Mode, Reno};
use super::HostContext;

use crate::segment::{Segment, MSS};
use crate::Error;

//           last_ack      next_seq
//           v             v
// ----------##############______________> byte offsets
//
// #: outstanding (in flight, retransmission timer set)
// _: sendable, within min(rwnd, cwnd - MSS) of bytes in flight

/// Counters reported once a transfer completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxStats {
    /// Data segments sent for the first time.
    pub segments_sent: u64,
    /// Segments resent because their retransmission timer expired.
    pub retransmissions: u64,
    /// Segments resent after three duplicate acks.
    pub fast_retransmits: u64,
}

/// Send side of a transfer: slices a byte source into segments, paces them under the congestion
/// and receive windows, and retires them as cumulative acks arrive.
pub struct SegmentTx<R> {
    // None once the source is exhausted
    source: Option<R>,
    cc: Reno,
    next_seq: u32,
    bytes_in_flight: u32,
    // Unbounded until the receiver advertises a window
    rwnd: Option<u32>,
    final_byte: Option<u32>,
    outstanding: BTreeMap<u32, Segment>,
    closing: bool,
    stats: TxStats,
    read_buffer: Box<[u8]>,
}

// Reads until `buffer` is full or the source is exhausted.
fn read_chunk<R: Read>(source: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err),
        }
    }

    Ok(filled)
}

impl<R: Read> SegmentTx<R> {
    pub fn new(source: R) -> Self {
        Self {
            source: Some(source),
            cc: Reno::new(),
            next_seq: 0,
            bytes_in_flight: 0,
            rwnd: None,
            final_byte: None,
            outstanding: BTreeMap::new(),
            closing: false,
            stats: TxStats::default(),
            read_buffer: vec![0; MSS].into_boxed_slice(),
        }
    }

    #[cfg(test)]
    pub fn cc(&self) -> &Reno {
        &self.cc
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    #[cfg(test)]
    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    #[cfg(test)]
    pub fn rwnd(&self) -> Option<u32> {
        self.rwnd
    }

    /// Offset one past the last byte of the source, once known.
    pub fn final_byte(&self) -> Option<u32> {
        self.final_byte
    }

    /// True once every byte of the source has been acknowledged.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    fn send_limit(&self) -> u32 {
        let cwnd_limit = self.cc.cwnd().saturating_sub(MSS as u32);

        self.rwnd.unwrap_or(u32::MAX).min(cwnd_limit)
    }

    fn begin_close<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        self.closing = true;
        self.cc.shutdown();

        for &seq_num in self.outstanding.keys() {
            ctx.unset_rto_timer(seq_num);
        }

        self.outstanding.clear();
        self.bytes_in_flight = 0;

        tracing::info!("all {} bytes acknowledged", self.next_seq);
    }

    /// Called once the handshake has completed.
    pub fn start<C>(&mut self, ctx: &mut C) -> Result<(), Error>
    where
        C: HostContext,
    {
        self.cc.establish();
        self.send_more(ctx)
    }

    /// Sends new data segments for as long as both windows allow.
    pub fn send_more<C>(&mut self, ctx: &mut C) -> Result<(), Error>
    where
        C: HostContext,
    {
        if self.closing || self.cc.mode() == Mode::Handshake {
            return Ok(());
        }

        while self.bytes_in_flight < self.send_limit() {
            let Some(source) = self.source.as_mut() else {
                break;
            };

            let len = read_chunk(source, &mut self.read_buffer).map_err(Error::Source)?;

            if len == 0 {
                tracing::debug!("end of source at byte {}", self.next_seq);

                self.source = None;
                self.final_byte = Some(self.next_seq);
                break;
            }

            // Bounded by MSS
            let len = len as u32;

            // The FIN acknowledgment must also fit in the sequence space
            let end = self
                .next_seq
                .checked_add(len)
                .filter(|&end| end < u32::MAX)
                .ok_or(Error::SourceTooLarge)?;

            let segment = Segment::data(self.next_seq, &self.read_buffer[..len as usize]);

            tracing::debug!(
                "send [{}, {}) (in flight {}, cwnd {}, rwnd {:?})",
                self.next_seq,
                end,
                self.bytes_in_flight + len,
                self.cc.cwnd(),
                self.rwnd
            );

            ctx.send_segment(&segment);
            ctx.set_rto_timer(segment.seq_num);

            self.outstanding.insert(segment.seq_num, segment);
            self.bytes_in_flight += len;
            self.next_seq = end;
            self.stats.segments_sent += 1;
        }

        // EOF may only be discovered after the last byte has already been acknowledged
        if self.final_byte == Some(self.cc.last_ack()) {
            self.begin_close(ctx);
        }

        Ok(())
    }

    /// Updates the receiver's advertised window.
    pub fn handle_window(&mut self, window: u16) {
        self.rwnd = Some(u32::from(window));
    }

    /// Processes a cumulative acknowledgment.
    pub fn handle_ack<C>(&mut self, ack_num: u32, ctx: &mut C) -> Result<(), Error>
    where
        C: HostContext,
    {
        if self.closing {
            return Ok(());
        }

        if ack_num < self.cc.last_ack() {
            tracing::trace!("stale ack {} (last ack {})", ack_num, self.cc.last_ack());
            return Ok(());
        }

        if ack_num > self.next_seq {
            tracing::trace!("ack {} beyond send offset {}", ack_num, self.next_seq);
            return Ok(());
        }

        // Retire everything the ack covers
        let remaining = self.outstanding.split_off(&ack_num);
        let retired = std::mem::replace(&mut self.outstanding, remaining);

        for (seq_num, segment) in retired {
            ctx.unset_rto_timer(seq_num);
            self.bytes_in_flight -= segment.payload_len();
        }

        if self.final_byte == Some(ack_num) {
            self.begin_close(ctx);
            return Ok(());
        }

        match self.cc.handle_ack(ack_num) {
            AckKind::FastRetransmit => {
                if let Some(segment) = self.outstanding.get(&ack_num) {
                    tracing::debug!(
                        "fast retransmit {} (cwnd {}, ssthresh {})",
                        ack_num,
                        self.cc.cwnd(),
                        self.cc.ssthresh()
                    );

                    ctx.send_segment(segment);
                    ctx.set_rto_timer(ack_num);

                    self.stats.fast_retransmits += 1;
                }

                Ok(())
            }
            AckKind::New | AckKind::Duplicate => {
                tracing::debug!(
                    "ack {} (in flight {}, cwnd {}, dup acks {})",
                    ack_num,
                    self.bytes_in_flight,
                    self.cc.cwnd(),
                    self.cc.dup_ack_count()
                );

                self.send_more(ctx)
            }
        }
    }

    /// Processes an expired retransmission timer.
    pub fn handle_timeout<C>(&mut self, seq_num: u32, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.closing || self.cc.last_ack() > seq_num {
            return;
        }

        let Some(segment) = self.outstanding.get(&seq_num) else {
            return;
        };

        self.cc.handle_timeout();

        tracing::debug!(
            "timeout {} (cwnd {}, ssthresh {})",
            seq_num,
            self.cc.cwnd(),
            self.cc.ssthresh()
        );

        ctx.send_segment(segment);
        ctx.set_rto_timer(seq_num);

        self.stats.retransmissions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::endpoint::mock::MockHostContext;

    use std::collections::VecDeque;
    use std::io::Cursor;

    const WINDOW: u16 = 19264;

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    fn started(len: usize) -> (SegmentTx<Cursor<Vec<u8>>>, MockHostContext) {
        let mut tx = SegmentTx::new(Cursor::new(test_data(len)));
        let mut ctx = MockHostContext::new();

        tx.start(&mut ctx).unwrap();

        (tx, ctx)
    }

    // Acknowledges each sent segment in order, as a lossless receiver would
    fn run_lossless(
        tx: &mut SegmentTx<Cursor<Vec<u8>>>,
        ctx: &mut MockHostContext,
    ) -> (Vec<Segment>, Vec<u32>) {
        let mut sent = Vec::new();
        let mut acks = Vec::new();
        let mut in_transit: VecDeque<Segment> = ctx.take_sent().into();

        while let Some(segment) = in_transit.pop_front() {
            let ack_num = segment.seq_num + segment.payload_len();
            sent.push(segment);

            tx.handle_window(WINDOW);
            tx.handle_ack(ack_num, ctx).unwrap();
            acks.push(ack_num);

            in_transit.extend(ctx.take_sent());
        }

        (sent, acks)
    }

    #[test]
    fn lossless_transfer() {
        let data = test_data(3500);
        let (mut tx, mut ctx) = started(3500);

        let (sent, acks) = run_lossless(&mut tx, &mut ctx);

        let lens: Vec<u32> = sent.iter().map(|s| s.payload_len()).collect();
        assert_eq!(lens, vec![1000, 1000, 1000, 500]);

        let payload: Vec<u8> = sent.iter().flat_map(|s| s.payload.iter().copied()).collect();
        assert_eq!(payload, data);

        assert_eq!(acks.last(), Some(&3500));
        assert_eq!(tx.final_byte(), Some(3500));
        assert!(tx.is_closing());
        assert_eq!(tx.cc().cwnd(), 0);
        assert_eq!(tx.bytes_in_flight(), 0);
        assert!(ctx.timers.is_empty());

        assert_eq!(
            tx.stats(),
            TxStats {
                segments_sent: 4,
                retransmissions: 0,
                fast_retransmits: 0,
            }
        );
    }

    #[test]
    fn initial_window_is_one_segment() {
        let (tx, mut ctx) = started(10_000);

        assert_eq!(ctx.sent_seq_nums(), vec![0]);
        assert_eq!(tx.bytes_in_flight(), 1000);
        assert!(ctx.timers.contains(&0));
    }

    #[test]
    fn receive_window_limits_sending() {
        let (mut tx, mut ctx) = started(50_000);
        ctx.take_sent();

        for k in 1..=10 {
            tx.handle_ack(k * 1000, &mut ctx).unwrap();
        }

        ctx.take_sent();
        assert_eq!(tx.bytes_in_flight(), 11_000);

        // A small window stops new sends until in-flight data drains below it
        tx.handle_window(3000);
        assert_eq!(tx.rwnd(), Some(3000));

        for k in 11..=18 {
            tx.handle_ack(k * 1000, &mut ctx).unwrap();
            assert!(ctx.take_sent().is_empty());
        }

        assert_eq!(tx.bytes_in_flight(), 3000);

        tx.handle_ack(19_000, &mut ctx).unwrap();
        assert_eq!(ctx.sent_seq_nums(), vec![21_000]);
        assert_eq!(tx.bytes_in_flight(), 3000);
    }

    #[test]
    fn fast_retransmit_once_per_loss() {
        let (mut tx, mut ctx) = started(20_000);
        assert_eq!(ctx.sent_seq_nums(), vec![0]);

        tx.handle_ack(1000, &mut ctx).unwrap();
        assert_eq!(ctx.sent_seq_nums(), vec![1000, 2000]);

        tx.handle_ack(2000, &mut ctx).unwrap();
        assert_eq!(ctx.sent_seq_nums(), vec![3000, 4000]);

        // Segment 2000 is lost; 3000 and 4000 and one more produce duplicates
        tx.handle_ack(2000, &mut ctx).unwrap();
        tx.handle_ack(2000, &mut ctx).unwrap();
        assert!(ctx.take_sent().is_empty());

        tx.handle_ack(2000, &mut ctx).unwrap();
        assert_eq!(ctx.sent_seq_nums(), vec![2000]);
        assert_eq!(tx.cc().mode(), Mode::FastRecovery);
        assert_eq!(tx.cc().ssthresh(), 2000);
        assert_eq!(tx.cc().cwnd(), 5000);

        // Further duplicates inflate the window without resending 2000
        tx.handle_ack(2000, &mut ctx).unwrap();
        let sent = ctx.sent_seq_nums();
        assert!(!sent.contains(&2000));
        assert_eq!(sent, vec![5000, 6000]);

        assert_eq!(tx.stats().fast_retransmits, 1);

        // Recovery ends with the first new ack
        tx.handle_ack(5000, &mut ctx).unwrap();
        assert_eq!(tx.cc().mode(), Mode::CongestionAvoidance);
        assert_eq!(tx.cc().cwnd(), 2000);
        assert_eq!(tx.bytes_in_flight(), 2000);
    }

    #[test]
    fn timeout_retransmits_outstanding_segment() {
        let (mut tx, mut ctx) = started(5000);
        ctx.take_sent();

        tx.handle_timeout(0, &mut ctx);

        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], Segment::data(0, &[]));
        assert_eq!(sent[0].payload_len(), 1000);
        assert!(ctx.timers.contains(&0));
        assert_eq!(tx.stats().retransmissions, 1);
        assert_eq!(tx.cc().mode(), Mode::SlowStart);

        // Once acknowledged, a late timeout changes nothing
        tx.handle_ack(1000, &mut ctx).unwrap();
        ctx.take_sent();
        let cwnd = tx.cc().cwnd();

        tx.handle_timeout(0, &mut ctx);
        assert!(ctx.take_sent().is_empty());
        assert_eq!(tx.cc().cwnd(), cwnd);
        assert_eq!(tx.stats().retransmissions, 1);

        // Nor does a timeout for a segment never sent
        tx.handle_timeout(9000, &mut ctx);
        assert!(ctx.take_sent().is_empty());
        assert_eq!(tx.cc().cwnd(), cwnd);
    }

    #[test]
    fn stale_and_future_acks_are_ignored() {
        let (mut tx, mut ctx) = started(20_000);

        tx.handle_ack(1000, &mut ctx).unwrap();
        tx.handle_ack(2000, &mut ctx).unwrap();
        ctx.take_sent();

        let in_flight = tx.bytes_in_flight();
        let next_seq = tx.next_seq();

        tx.handle_ack(1000, &mut ctx).unwrap();
        assert_eq!(tx.bytes_in_flight(), in_flight);
        assert_eq!(tx.cc().last_ack(), 2000);
        assert_eq!(tx.cc().dup_ack_count(), 0);

        tx.handle_ack(next_seq + 1000, &mut ctx).unwrap();
        assert_eq!(tx.bytes_in_flight(), in_flight);
        assert_eq!(tx.cc().last_ack(), 2000);

        assert!(ctx.take_sent().is_empty());
    }

    #[test]
    fn empty_source_closes_immediately() {
        let (tx, mut ctx) = started(0);

        assert!(ctx.take_sent().is_empty());
        assert_eq!(tx.final_byte(), Some(0));
        assert!(tx.is_closing());
    }

    #[test]
    fn eof_discovered_after_final_ack() {
        // Exactly one segment: EOF is only seen once the window opens again
        let (mut tx, mut ctx) = started(1000);
        assert_eq!(ctx.sent_seq_nums(), vec![0]);
        assert_eq!(tx.final_byte(), None);

        tx.handle_ack(1000, &mut ctx).unwrap();

        assert!(ctx.take_sent().is_empty());
        assert_eq!(tx.final_byte(), Some(1000));
        assert!(tx.is_closing());
    }

    #[test]
    fn closing_ignores_further_events() {
        let (mut tx, mut ctx) = started(500);
        assert_eq!(tx.final_byte(), Some(500));

        tx.handle_ack(500, &mut ctx).unwrap();
        assert!(tx.is_closing());
        ctx.take_sent();

        tx.handle_timeout(0, &mut ctx);
        tx.handle_ack(500, &mut ctx).unwrap();
        tx.send_more(&mut ctx).unwrap();

        assert!(ctx.take_sent().is_empty());
    }

    #[test]
    fn source_errors_propagate() {
        struct FailingSource;

        impl Read for FailingSource {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
            }
        }

        let mut tx = SegmentTx::new(FailingSource);
        let mut ctx = MockHostContext::new();

        assert!(matches!(tx.start(&mut ctx), Err(Error::Source(_))));
    }

    #[test]
    fn sequence_space_limit() {
        // The last data byte may end at u32::MAX - 1, leaving room for the FIN ack
        let mut tx = SegmentTx::new(Cursor::new(test_data(1000)));
        let mut ctx = MockHostContext::new();
        tx.next_seq = u32::MAX - 1001;

        tx.start(&mut ctx).unwrap();
        assert_eq!(ctx.sent_seq_nums(), vec![u32::MAX - 1001]);
        assert_eq!(tx.next_seq(), u32::MAX - 1);

        // Ending exactly at u32::MAX is rejected
        let mut tx = SegmentTx::new(Cursor::new(test_data(1000)));
        let mut ctx = MockHostContext::new();
        tx.next_seq = u32::MAX - 1000;

        assert!(matches!(tx.start(&mut ctx), Err(Error::SourceTooLarge)));
        assert!(ctx.take_sent().is_empty());

        // As is anything past it
        let mut tx = SegmentTx::new(Cursor::new(test_data(1000)));
        let mut ctx = MockHostContext::new();
        tx.next_seq = u32::MAX - 10;

        assert!(matches!(tx.start(&mut ctx), Err(Error::SourceTooLarge)));
        assert!(ctx.take_sent().is_empty());
    }
}
