// TCP-Reno-like congestion control, informed by:
// https://intronetworks.cs.luc.edu/current/html/reno.html
//
// Windows are tracked in whole bytes. Arithmetic is integer throughout, so congestion avoidance
// grows by floor(MSS * MSS / cwnd) per ack.

use crate::segment::MSS;

const MSS_U32: u32 = MSS as u32;

const INITIAL_CWND: u32 = 2 * MSS_U32;
const INITIAL_SSTHRESH: u32 = 64_000;

const MIN_CWND: u32 = 2 * MSS_U32;

// Number of repeated acks that signal a drop [19.3]
const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Handshake,
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

/// Classification of a received cumulative ack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    /// The ack advanced past the previous one.
    New,
    /// The ack repeated the previous one.
    Duplicate,
    /// The ack repeated the previous one for the third time; the segment at the acked offset
    /// should be resent immediately.
    FastRetransmit,
}

pub struct Reno {
    mode: Mode,
    cwnd: u32,
    ssthresh: u32,
    dup_ack_count: u32,
    last_ack: u32,
}

// Rounds down to a whole number of segments before halving. Never goes below two segments.
fn halve(cwnd: u32) -> u32 {
    if cwnd <= MIN_CWND {
        return cwnd;
    }

    ((cwnd - cwnd % MSS_U32) / 2).max(MIN_CWND)
}

impl Reno {
    pub fn new() -> Self {
        Self {
            mode: Mode::Handshake,
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            dup_ack_count: 0,
            last_ack: 0,
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            tracing::info!(
                "congestion state {:?} -> {:?} (cwnd {}, ssthresh {})",
                self.mode,
                mode,
                self.cwnd,
                self.ssthresh
            );
            self.mode = mode;
        }
    }

    /// Called once the handshake completes.
    pub fn establish(&mut self) {
        if self.mode == Mode::Handshake {
            self.set_mode(Mode::SlowStart);
        }
    }

    pub fn handle_ack(&mut self, ack_num: u32) -> AckKind {
        if ack_num == self.last_ack {
            self.dup_ack_count += 1;

            if self.mode == Mode::FastRecovery {
                // Each duplicate means another segment has left the network [19.3]
                self.cwnd = self.cwnd.saturating_add(MSS_U32);
            }

            if self.dup_ack_count == DUP_ACK_THRESHOLD {
                self.cwnd = halve(self.cwnd);
                self.ssthresh = self.cwnd;
                self.cwnd = self.cwnd.saturating_add(3 * MSS_U32);
                self.set_mode(Mode::FastRecovery);

                return AckKind::FastRetransmit;
            }

            return AckKind::Duplicate;
        }

        self.dup_ack_count = 0;
        self.last_ack = ack_num;

        match self.mode {
            Mode::Handshake => (),
            Mode::SlowStart => {
                // Double cwnd each RTT [19.2]
                self.cwnd = self.cwnd.saturating_add(MSS_U32);

                if self.cwnd > self.ssthresh {
                    self.set_mode(Mode::CongestionAvoidance);
                }
            }
            Mode::CongestionAvoidance => {
                // Roughly one MSS per RTT [19.2.1]
                self.cwnd = self.cwnd.saturating_add(MSS_U32 * MSS_U32 / self.cwnd);
            }
            Mode::FastRecovery => {
                // Deflate the window once the lost segment is acknowledged [19.3]
                self.cwnd = self.ssthresh;
                self.set_mode(Mode::CongestionAvoidance);
            }
        }

        AckKind::New
    }

    pub fn handle_timeout(&mut self) {
        match self.mode {
            Mode::CongestionAvoidance | Mode::FastRecovery => {
                self.cwnd = halve(self.cwnd);
                self.ssthresh = self.cwnd;
                self.cwnd = self.ssthresh.saturating_add(3 * MSS_U32);
                self.set_mode(Mode::SlowStart);
            }
            Mode::SlowStart => {
                self.cwnd = halve(self.cwnd);
                self.ssthresh = self.cwnd;
            }
            Mode::Handshake => (),
        }
    }

    /// Closes the window so nothing more is sent while the connection drains.
    pub fn shutdown(&mut self) {
        self.cwnd = 0;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }
}

impl Default for Reno {
    fn default() -> Self {
        Self::new()
    }
}
