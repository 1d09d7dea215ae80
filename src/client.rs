use std::fs;
use std::io::{self, Read};
use std::net;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use super::endpoint;
use super::impairment::{Impairment, ImpairmentConfig};
use super::retransmit::RetransmitTimers;
use super::segment::{Segment, MTU};
use super::socket;
use super::{Error, Result};

const TIMEOUT_DEFAULT_MS: u64 = 1000;

// Initial sequence number of the sending side
const LOCAL_SEQ: u32 = 0;

// How long the listener waits on the socket before checking whether it should stop
const LISTENER_POLL_INTERVAL: time::Duration = time::Duration::from_millis(20);

/// Determines how many times the handshake and teardown exchanges are attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry until the server responds.
    Unbounded,
    /// Give up with [`Error::Timeout`] after this many attempts.
    Limit(u32),
}

impl RetryPolicy {
    /// Returns true if another attempt may follow `attempts` unanswered ones.
    pub fn allows(&self, attempts: u32) -> bool {
        match *self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Limit(limit) => attempts < limit,
        }
    }
}

/// Configuration for a [`Client`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Retransmission timeout for data segments, in milliseconds. Handshake and teardown
    /// responses are awaited for twice this long.
    ///
    /// Default value: 1,000
    pub timeout_ms: u64,

    /// Retry policy for the handshake and teardown.
    ///
    /// Default value: [`RetryPolicy::Unbounded`]
    pub retry: RetryPolicy,

    /// Synthetic loss and delay applied to outgoing data segments.
    ///
    /// Default value: None
    pub impairment: Option<ImpairmentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: TIMEOUT_DEFAULT_MS,
            retry: RetryPolicy::Unbounded,
            impairment: None,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.timeout_ms > 0,
            "invalid client configuration: timeout_ms == 0"
        );
        assert!(
            self.retry != RetryPolicy::Limit(0),
            "invalid client configuration: retry limit of zero attempts"
        );

        if let Some(impairment) = &self.impairment {
            impairment.validate();
        }
    }
}

/// Statistics of a completed transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    /// Length of the transferred stream.
    pub byte_count: u64,
    /// Data segments sent, excluding retransmissions.
    pub segments_sent: u64,
    /// Segments resent after their retransmission timer expired.
    pub retransmissions: u64,
    /// Segments resent after three duplicate acks.
    pub fast_retransmits: u64,
    /// SYNs sent before the server answered.
    pub handshake_attempts: u32,
    /// FINs sent before the server answered.
    pub teardown_attempts: u32,
    /// Time from the start of the transfer until the teardown completed.
    pub elapsed: time::Duration,
}

// Forwarded from the listener thread. SYN+ACK echoes of a retried handshake only carry a window.
#[derive(Debug, PartialEq, Eq)]
struct Inbound {
    ack_num: Option<u32>,
    window: u16,
}

impl Inbound {
    fn from_segment(segment: &Segment) -> Option<Self> {
        if !segment.flags.ack {
            return None;
        }

        Some(Self {
            ack_num: (!segment.flags.syn).then_some(segment.ack_num),
            window: segment.window,
        })
    }
}

struct EndpointContext<'a> {
    client: &'a mut ClientCore,
}

struct ClientCore {
    // Saved configuration
    config: Config,
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    // Socket send handle
    socket_tx: socket::ConnectedSocketTx,
    // One timer per outstanding segment
    timers: RetransmitTimers,
    // Applied to data segments, if configured
    impairment: Option<Impairment>,
    handshake_attempts: u32,
    // Window advertised in the SYN+ACK
    handshake_window: u16,
}

/// An fcntcp client connection.
pub struct Client {
    // Interesting client data
    core: ClientCore,
    // Socket receive handle
    socket_rx: socket::ConnectedSocketRx,
}

impl<'a> EndpointContext<'a> {
    fn new(client: &'a mut ClientCore) -> Self {
        Self { client }
    }
}

impl<'a> endpoint::HostContext for EndpointContext<'a> {
    fn send_segment(&mut self, segment: &Segment) {
        let datagram = segment.encode();

        match &self.client.impairment {
            Some(impairment) => {
                let socket_tx = self.client.socket_tx.clone();
                impairment.dispatch(move || socket_tx.send(&datagram));
            }
            None => self.client.socket_tx.send(&datagram),
        }
    }

    fn set_rto_timer(&mut self, seq_num: u32) {
        let deadline_ms = self.client.time_now_ms() + self.client.config.timeout_ms;
        self.client.timers.arm(seq_num, deadline_ms);
    }

    fn unset_rto_timer(&mut self, seq_num: u32) {
        self.client.timers.disarm(seq_num);
    }
}

/// Waits up to `timeout` for a valid segment satisfying `accept`. Everything else is discarded.
fn wait_for_segment<P>(
    socket_rx: &mut socket::ConnectedSocketRx,
    timeout: time::Duration,
    mut accept: P,
) -> Option<Segment>
where
    P: FnMut(&Segment) -> bool,
{
    let deadline = time::Instant::now() + timeout;

    loop {
        let now = time::Instant::now();

        if now >= deadline {
            return None;
        }

        match socket_rx.wait_for_datagram(Some(deadline - now)) {
            Ok(Some(datagram)) => match Segment::decode(datagram) {
                Ok(segment) if accept(&segment) => return Some(segment),
                Ok(segment) => {
                    tracing::trace!("ignoring {:?} {}", segment.flags, segment.seq_num);
                }
                Err(err) => {
                    tracing::trace!("dropped datagram: {}", err);
                }
            },
            Ok(None) => (),
            Err(err) => {
                // Typically a refused connection; nothing to do but wait out the attempt
                tracing::debug!("receive failed: {}", err);
                thread::sleep(deadline.saturating_duration_since(time::Instant::now()));
                return None;
            }
        }
    }
}

/// Receives acknowledgments until told to stop, then hands back the socket.
fn listen(
    mut socket_rx: socket::ConnectedSocketRx,
    inbound_tx: mpsc::Sender<Inbound>,
    stop: Arc<AtomicBool>,
) -> socket::ConnectedSocketRx {
    while !stop.load(Ordering::Acquire) {
        match socket_rx.wait_for_datagram(Some(LISTENER_POLL_INTERVAL)) {
            Ok(Some(datagram)) => match Segment::decode(datagram) {
                Ok(segment) => match Inbound::from_segment(&segment) {
                    Some(inbound) => {
                        if inbound_tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::trace!("ignoring {:?} {}", segment.flags, segment.seq_num);
                    }
                },
                Err(err) => {
                    tracing::trace!("dropped datagram: {}", err);
                }
            },
            Ok(None) => (),
            Err(err) => {
                tracing::debug!("receive failed: {}", err);
            }
        }
    }

    socket_rx
}

impl ClientCore {
    /// Returns the number of whole milliseconds elapsed since the client object was created.
    fn time_now_ms(&self) -> u64 {
        (time::Instant::now() - self.time_ref).as_millis() as u64
    }

    fn response_timeout(&self) -> time::Duration {
        time::Duration::from_millis(2 * self.config.timeout_ms)
    }

    /// Returns the time remaining until the next timer expires.
    fn next_timer_timeout(&self) -> Option<time::Duration> {
        let now_ms = self.time_now_ms();

        self.timers
            .next_deadline_ms()
            .map(|t_ms| time::Duration::from_millis(t_ms.saturating_sub(now_ms)))
    }

    fn handshake(&mut self, socket_rx: &mut socket::ConnectedSocketRx) -> Result<()> {
        let syn = Segment::syn(LOCAL_SEQ).encode();

        loop {
            if !self.config.retry.allows(self.handshake_attempts) {
                return Err(Error::Timeout {
                    attempts: self.handshake_attempts,
                });
            }

            self.handshake_attempts += 1;

            tracing::debug!("sending SYN (attempt {})", self.handshake_attempts);
            self.socket_tx.send(&syn);

            let syn_ack = wait_for_segment(socket_rx, self.response_timeout(), |segment| {
                segment.flags.syn && segment.flags.ack && segment.ack_num == LOCAL_SEQ
            });

            if let Some(syn_ack) = syn_ack {
                self.handshake_window = syn_ack.window;

                self.socket_tx
                    .send(&Segment::ack(LOCAL_SEQ, syn_ack.seq_num, 0).encode());

                tracing::info!("connected to {}", socket_rx.peer_addr());

                return Ok(());
            }
        }
    }

    fn run<R>(
        &mut self,
        tx: &mut endpoint::SegmentTx<R>,
        inbound_rx: &mpsc::Receiver<Inbound>,
    ) -> Result<()>
    where
        R: Read,
    {
        tx.handle_window(self.handshake_window);
        tx.start(&mut EndpointContext::new(self))?;

        let idle_timeout = time::Duration::from_millis(self.config.timeout_ms);
        let mut expired = Vec::new();

        while !tx.is_closing() {
            let wait = self.next_timer_timeout().unwrap_or(idle_timeout);

            match inbound_rx.recv_timeout(wait) {
                Ok(inbound) => {
                    tx.handle_window(inbound.window);

                    if let Some(ack_num) = inbound.ack_num {
                        tx.handle_ack(ack_num, &mut EndpointContext::new(self))?;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::ListenerStopped),
            }

            let now_ms = self.time_now_ms();
            self.timers.expire(now_ms, &mut expired);

            for seq_num in expired.drain(..) {
                tx.handle_timeout(seq_num, &mut EndpointContext::new(self));
            }
        }

        Ok(())
    }

    fn close(&mut self, socket_rx: &mut socket::ConnectedSocketRx, final_byte: u32) -> Result<u32> {
        let fin = Segment::fin(final_byte).encode();
        let fin_ack = final_byte.wrapping_add(1);

        let mut attempts = 0;

        loop {
            if !self.config.retry.allows(attempts) {
                return Err(Error::Timeout { attempts });
            }

            attempts += 1;

            tracing::debug!("sending FIN {} (attempt {})", final_byte, attempts);
            self.socket_tx.send(&fin);

            let ack = wait_for_segment(socket_rx, self.response_timeout(), |segment| {
                segment.flags.ack && !segment.flags.syn && segment.ack_num == fin_ack
            });

            if ack.is_some() {
                tracing::info!("connection closed");
                return Ok(attempts);
            }
        }
    }
}

impl Client {
    /// Equivalent to calling [`Client::connect_with_config`] with default configuration.
    pub fn connect<A>(server_addr: A) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::connect_with_config(server_addr, Default::default())
    }

    /// Performs the handshake with the server at the given address. Blocks until the server
    /// responds, or until the retry policy gives up.
    ///
    /// # Panics
    ///
    /// Panics if the provided configuration is invalid.
    pub fn connect_with_config<A>(server_addr: A, config: Config) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let server_addr = server_addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")
        })?;

        let bind_address: net::SocketAddr = if server_addr.is_ipv4() {
            (net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        // One spare byte so oversized datagrams are detected rather than silently truncated
        let (socket_tx, mut socket_rx) =
            socket::new_connected(bind_address, server_addr, MTU + 1)?;

        let impairment = config.impairment.map(Impairment::new);

        let mut core = ClientCore {
            config,
            time_ref: time::Instant::now(),
            socket_tx,
            timers: RetransmitTimers::new(0),
            impairment,
            handshake_attempts: 0,
            handshake_window: 0,
        };

        core.handshake(&mut socket_rx)?;

        Ok(Self { core, socket_rx })
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.socket_rx.peer_addr()
    }

    /// Sends everything `source` yields, then tears the connection down. Blocks until the server
    /// has acknowledged both the data and the teardown.
    pub fn transfer<R>(self, source: R) -> Result<Summary>
    where
        R: Read,
    {
        let Client { mut core, socket_rx } = self;

        let start = time::Instant::now();

        let (inbound_tx, inbound_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let listener = {
            let stop = Arc::clone(&stop);

            thread::Builder::new()
                .name("fcntcp-listener".into())
                .spawn(move || listen(socket_rx, inbound_tx, stop))?
        };

        let mut tx = endpoint::SegmentTx::new(source);

        let result = core.run(&mut tx, &inbound_rx);

        // Nothing may be resent once the listener is gone
        stop.store(true, Ordering::Release);
        let joined = listener.join();
        core.timers.disarm_all();

        let mut socket_rx = joined.map_err(|_| Error::ListenerStopped)?;
        result?;

        let final_byte = tx.final_byte().unwrap_or(tx.next_seq());
        let teardown_attempts = core.close(&mut socket_rx, final_byte)?;

        let stats = tx.stats();

        Ok(Summary {
            byte_count: u64::from(final_byte),
            segments_sent: stats.segments_sent,
            retransmissions: stats.retransmissions,
            fast_retransmits: stats.fast_retransmits,
            handshake_attempts: core.handshake_attempts,
            teardown_attempts,
            elapsed: start.elapsed(),
        })
    }
}

/// Connects to `server_addr` and sends the file at `path`.
pub fn send_file<A, P>(server_addr: A, path: P, config: Config) -> Result<Summary>
where
    A: net::ToSocketAddrs,
    P: AsRef<Path>,
{
    let file = fs::File::open(path).map_err(Error::Source)?;

    let client = Client::connect_with_config(server_addr, config)?;

    client.transfer(io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy() {
        assert!(RetryPolicy::Unbounded.allows(0));
        assert!(RetryPolicy::Unbounded.allows(u32::MAX));

        assert!(RetryPolicy::Limit(3).allows(0));
        assert!(RetryPolicy::Limit(3).allows(2));
        assert!(!RetryPolicy::Limit(3).allows(3));
    }

    #[test]
    #[should_panic]
    fn zero_timeout_is_invalid() {
        Config {
            timeout_ms: 0,
            ..Default::default()
        }
        .validate();
    }

    #[test]
    fn handshake_gives_up() {
        // Nothing listens here
        let (_silent_tx, silent_rx) = socket::new("127.0.0.1:0", MTU).unwrap();

        let config = Config {
            timeout_ms: 10,
            retry: RetryPolicy::Limit(3),
            impairment: None,
        };

        let result = Client::connect_with_config(silent_rx.local_addr(), config);

        assert!(matches!(result, Err(Error::Timeout { attempts: 3 })));
    }

    #[test]
    fn inbound_classification() {
        assert_eq!(
            Inbound::from_segment(&Segment::ack(0, 3000, 19264)),
            Some(Inbound {
                ack_num: Some(3000),
                window: 19264
            })
        );

        // Echoed SYN+ACKs update the window but never acknowledge data
        assert_eq!(
            Inbound::from_segment(&Segment::syn_ack(0, 0, 4000)),
            Some(Inbound {
                ack_num: None,
                window: 4000
            })
        );

        assert_eq!(Inbound::from_segment(&Segment::syn(0)), None);
        assert_eq!(Inbound::from_segment(&Segment::fin(3000)), None);
        assert_eq!(Inbound::from_segment(&Segment::data(0, b"abc")), None);
    }

    #[test]
    fn handshake_records_window() {
        let server = net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(time::Duration::from_secs(2)))
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = thread::spawn(move || {
            let mut buffer = [0u8; MTU];
            let (len, peer) = server.recv_from(&mut buffer).unwrap();

            assert!(Segment::decode(&buffer[..len]).unwrap().flags.syn);
            server
                .send_to(&Segment::syn_ack(0, 0, 1234).encode(), peer)
                .unwrap();
        });

        let client = Client::connect(server_addr).unwrap();
        responder.join().unwrap();

        assert_eq!(client.core.handshake_window, 1234);
        assert_eq!(client.core.handshake_attempts, 1);
    }
}
