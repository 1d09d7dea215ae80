/*

https://intronetworks.cs.luc.edu/current/html/reno.html

fcntcp moves a single byte stream (a file) from a client to a server over UDP, with TCP-like
reliability and congestion control implemented entirely in user space.

# Segments

Every datagram carries exactly one segment: a fixed 20 byte header followed by at most MSS = 1000
bytes of payload. Sequence and acknowledgment numbers are byte offsets into the stream, not segment
counters. The header checksum is the Internet checksum of the payload, and a segment whose checksum
does not match is discarded as if it was never received.

# Handshake and teardown

The client sends SYN(0) and waits 2 * timeout for SYN+ACK(0, 0), retrying until one arrives, then
answers with ACK(0, 0). The server treats the handshake as complete when that ACK arrives, or when
the first data segment arrives in its place.

Once every byte has been acknowledged, the client sends FIN(f), where f is the length of the stream,
and waits 2 * timeout for ACK(f + 1), retrying until one arrives. The server answers every FIN it
sees, even after the transfer has finished, so a lost ACK is recovered by the next FIN.

# Acknowledgment

Acknowledgments are cumulative. The server acks every data segment with the next byte offset it
expects, and buffers segments which arrive ahead of a gap until the gap is filled:

  next                     next
  v                        v
  ####____xxxx__ => (1000) ################__  deliver [1000, 2000) and buffered [2000, 3000)

# Congestion window

The client keeps at most min(rwnd, cwnd - MSS) bytes in flight, where rwnd is the window most
recently advertised by the server. cwnd follows TCP Reno:

In slow start, each new ack increases cwnd by:

  cwnd <- cwnd + MSS

until cwnd exceeds ssthresh, after which each new ack increases cwnd by:

  cwnd <- cwnd + MSS * MSS / cwnd

Three duplicate acks for offset A resend the segment at A immediately and enter fast recovery:

  ssthresh <- halve(cwnd)
  cwnd <- ssthresh + 3 * MSS

In fast recovery each further duplicate inflates cwnd by one MSS, and the first new ack deflates it
back to ssthresh.

Each segment has its own retransmission timer. When one expires the segment is resent. Outside of
slow start, ssthresh and cwnd are then set as for three duplicate acks, but the sender falls back to
slow start rather than fast recovery. In slow start, cwnd is halved and becomes ssthresh. halve()
rounds down to a whole number of segments and never goes below 2 * MSS.

# Threads

The client runs a listener thread which owns the receive half of the socket and forwards decoded
acks over a channel. Everything else (acks, timer expiry, sending) happens on the calling thread,
which owns the send half, the timer wheel and all congestion state, so state transitions are
totally ordered. The server is a single poll loop.

*/

pub mod client;
mod endpoint;
pub mod impairment;
mod retransmit;
pub mod segment;
pub mod server;
mod socket;
mod timer_wheel;

use std::io;

pub use impairment::ImpairmentConfig;

pub type Client = client::Client;
pub type Server = server::Server;

/// Fatal errors. Lost, corrupted or reordered segments are handled internally and never surface
/// here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket could not be created, bound, or connected.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The byte source could not be read.
    #[error("failed to read source: {0}")]
    Source(#[source] io::Error),
    /// The byte source does not fit in the 32-bit sequence space.
    #[error("source exceeds {} bytes", u32::MAX - 1)]
    SourceTooLarge,
    /// The retry policy gave up on the handshake or teardown.
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },
    /// The thread receiving acknowledgments exited unexpectedly.
    #[error("listener thread stopped unexpectedly")]
    ListenerStopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
