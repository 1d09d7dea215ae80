use super::segment_rx::{Disposition, SegmentRx};

use crate::segment::Segment;

// Initial sequence number of the receiving side
const LOCAL_SEQ: u32 = 0;

/// Host side of the receiving endpoint.
pub trait PassiveContext {
    // Called to transmit a segment to the remote host.
    fn send_segment(&mut self, segment: &Segment);

    // Called when a handshake completes
    fn on_connect(&mut self);

    // Called when the remote host has finished sending, with the digest of everything received
    fn on_finish(&mut self, digest: String, byte_count: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassiveState {
    Listen,
    SynReceived { timeout_time_ms: u64 },
    Established,
}

/// Receiver state machine: passive handshake, in-order delivery and passive teardown.
pub struct Passive {
    state: PassiveState,
    rx: SegmentRx,
    // Advertised on every acknowledgment
    window: u16,
    handshake_timeout_ms: u64,
}

impl Passive {
    /// `receive_window` is truncated to its low 16 bits when advertised.
    pub fn new(receive_window: u32, handshake_timeout_ms: u64) -> Self {
        Self {
            state: PassiveState::Listen,
            rx: SegmentRx::new(),
            window: (receive_window & 0xFFFF) as u16,
            handshake_timeout_ms,
        }
    }

    pub fn state(&self) -> PassiveState {
        self.state
    }

    #[cfg(test)]
    pub fn next_seq(&self) -> u32 {
        self.rx.next_seq()
    }

    /// Deadline of the pending handshake, if any.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        match self.state {
            PassiveState::SynReceived { timeout_time_ms } => Some(timeout_time_ms),
            _ => None,
        }
    }

    /// Abandons a handshake whose final ACK never arrived.
    pub fn handle_timeout(&mut self, now_ms: u64) {
        if let PassiveState::SynReceived { timeout_time_ms } = self.state {
            if now_ms >= timeout_time_ms {
                tracing::info!("handshake timed out, listening");
                self.state = PassiveState::Listen;
            }
        }
    }

    fn send_syn_ack<C>(&mut self, syn: &Segment, now_ms: u64, ctx: &mut C)
    where
        C: PassiveContext,
    {
        ctx.send_segment(&Segment::syn_ack(LOCAL_SEQ, syn.seq_num, self.window));

        self.state = PassiveState::SynReceived {
            timeout_time_ms: now_ms + self.handshake_timeout_ms,
        };
    }

    fn establish<C>(&mut self, ctx: &mut C)
    where
        C: PassiveContext,
    {
        tracing::info!("connection established");

        self.state = PassiveState::Established;
        ctx.on_connect();
    }

    fn handle_data<C>(&mut self, segment: &Segment, ctx: &mut C)
    where
        C: PassiveContext,
    {
        let disposition = self.rx.receive(segment.seq_num, &segment.payload);

        match disposition {
            Disposition::Delivered => tracing::debug!(
                "received [{}, {}), next {}",
                segment.seq_num,
                segment.seq_num.wrapping_add(segment.payload_len()),
                self.rx.next_seq()
            ),
            Disposition::Buffered => tracing::debug!(
                "buffered {} ahead of {}",
                segment.seq_num,
                self.rx.next_seq()
            ),
            Disposition::Duplicate => tracing::debug!("duplicate {}", segment.seq_num),
        }

        ctx.send_segment(&Segment::ack(LOCAL_SEQ, self.rx.next_seq(), self.window));
    }

    fn handle_fin<C>(&mut self, fin: &Segment, ctx: &mut C)
    where
        C: PassiveContext,
    {
        // Always answered, so a lost ACK is recovered by the sender's next FIN
        ctx.send_segment(&Segment::ack(
            LOCAL_SEQ,
            fin.seq_num.wrapping_add(1),
            self.window,
        ));

        match self.state {
            PassiveState::SynReceived { .. } | PassiveState::Established => {
                let (digest, byte_count) = self.rx.finish();

                tracing::info!("transfer finished: {} bytes, md5 {}", byte_count, digest);

                self.state = PassiveState::Listen;
                ctx.on_finish(digest, byte_count);
            }
            PassiveState::Listen => {
                tracing::trace!("repeated FIN {}", fin.seq_num);
            }
        }
    }

    pub fn handle_segment<C>(&mut self, segment: &Segment, now_ms: u64, ctx: &mut C)
    where
        C: PassiveContext,
    {
        let flags = segment.flags;

        if flags.fin {
            self.handle_fin(segment, ctx);
            return;
        }

        let is_syn = flags.syn && !flags.ack;

        match self.state {
            PassiveState::Listen => {
                if is_syn {
                    tracing::debug!("SYN {}, sending SYN+ACK", segment.seq_num);
                    self.send_syn_ack(segment, now_ms, ctx);
                } else if flags.is_empty() {
                    // Usually a sender whose handshake ACK was lost, and whose handshake expired
                    // before any of its data arrived
                    tracing::debug!(
                        "ignoring data {} outside of a connection (handshake expired?)",
                        segment.seq_num
                    );
                } else {
                    tracing::trace!("ignoring {:?} while listening", flags);
                }
            }
            PassiveState::SynReceived { .. } => {
                if is_syn {
                    // Our SYN+ACK was lost
                    tracing::debug!("repeated SYN {}, resending SYN+ACK", segment.seq_num);
                    self.send_syn_ack(segment, now_ms, ctx);
                } else if flags.ack && !flags.syn {
                    if segment.ack_num == self.rx.next_seq() {
                        self.establish(ctx);
                    } else {
                        tracing::debug!(
                            "handshake ACK {} does not match {}, listening",
                            segment.ack_num,
                            self.rx.next_seq()
                        );
                        self.state = PassiveState::Listen;
                    }
                } else if flags.is_empty() {
                    // Data implies the peer saw our SYN+ACK; its ACK was lost
                    self.establish(ctx);
                    self.handle_data(segment, ctx);
                }
            }
            PassiveState::Established => {
                if flags.is_empty() {
                    self.handle_data(segment, ctx);
                } else {
                    tracing::trace!("ignoring {:?} while established", flags);
                }
            }
        }
    }
}
