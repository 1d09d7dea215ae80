use std::collections::VecDeque;
use std::net;
use std::time;

use super::endpoint::{Passive, PassiveContext, PassiveState};
use super::impairment::{Impairment, ImpairmentConfig};
use super::segment::{Segment, MSS, MTU};
use super::socket;
use super::Result;

const TIMEOUT_DEFAULT_MS: u64 = 1000;
const RECEIVE_WINDOW_DEFAULT: u32 = 5_000_000;

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base timeout, in milliseconds. A handshake is abandoned if its final ACK does not arrive
    /// within twice this long.
    ///
    /// Default value: 1,000
    pub timeout_ms: u64,

    /// Receive window advertised to clients. Only the low 16 bits are sent, which must amount to
    /// at least one full segment.
    ///
    /// Default value: 5,000,000 (advertised as 19,264)
    pub receive_window: u32,

    /// Synthetic loss and delay applied to outgoing acknowledgments.
    ///
    /// Default value: None
    pub impairment: Option<ImpairmentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: TIMEOUT_DEFAULT_MS,
            receive_window: RECEIVE_WINDOW_DEFAULT,
            impairment: None,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.timeout_ms > 0,
            "invalid server configuration: timeout_ms == 0"
        );
        assert!(
            (self.receive_window & 0xFFFF) as usize >= MSS,
            "invalid server configuration: advertised receive window smaller than {} bytes",
            MSS
        );

        if let Some(impairment) = &self.impairment {
            impairment.validate();
        }
    }
}

/// A completed transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Address of the client which sent the data.
    pub peer: net::SocketAddr,
    /// Lowercase hex MD5 digest of the received stream.
    pub digest: String,
    /// Length of the received stream.
    pub byte_count: u64,
}

/// Represents a server event.
#[derive(Debug)]
pub enum Event {
    /// Produced when a client has completed the handshake.
    Connect(net::SocketAddr),
    /// Produced when a client has finished sending and closed the connection.
    Finish(Transfer),
}

struct PassiveHost<'a> {
    server: &'a mut ServerCore,
    peer: net::SocketAddr,
}

struct ServerCore {
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    // Socket send handle
    socket_tx: socket::SocketTx,
    // Client currently being served, if any
    peer: Option<net::SocketAddr>,
    // Applied to outgoing segments, if configured
    impairment: Option<Impairment>,
    // Queue of events
    events: VecDeque<Event>,
}

/// An fcntcp server. Serves one client at a time, indefinitely.
pub struct Server {
    // Interesting server data
    core: ServerCore,
    // Receiver state machine
    passive: Passive,
    // Socket receive handle
    socket_rx: socket::SocketRx,
}

impl<'a> PassiveHost<'a> {
    fn new(server: &'a mut ServerCore, peer: net::SocketAddr) -> Self {
        Self { server, peer }
    }
}

impl<'a> PassiveContext for PassiveHost<'a> {
    fn send_segment(&mut self, segment: &Segment) {
        let datagram = segment.encode();
        let peer = self.peer;

        match &self.server.impairment {
            Some(impairment) => {
                let socket_tx = self.server.socket_tx.clone();
                impairment.dispatch(move || socket_tx.send(&datagram, &peer));
            }
            None => self.server.socket_tx.send(&datagram, &peer),
        }
    }

    fn on_connect(&mut self) {
        self.server.events.push_back(Event::Connect(self.peer));
    }

    fn on_finish(&mut self, digest: String, byte_count: u64) {
        self.server.events.push_back(Event::Finish(Transfer {
            peer: self.peer,
            digest,
            byte_count,
        }));
    }
}

impl ServerCore {
    /// Returns the number of whole milliseconds elapsed since the server object was created.
    fn time_now_ms(&self) -> u64 {
        (time::Instant::now() - self.time_ref).as_millis() as u64
    }

    /// Returns the time remaining until the pending handshake expires.
    fn next_timer_timeout(&self, passive: &Passive) -> Option<time::Duration> {
        let now_ms = self.time_now_ms();

        passive
            .next_timeout_ms()
            .map(|t_ms| time::Duration::from_millis(t_ms.saturating_sub(now_ms)))
    }

    fn handle_timeouts(&mut self, passive: &mut Passive) {
        passive.handle_timeout(self.time_now_ms());

        if passive.state() == PassiveState::Listen {
            self.peer = None;
        }
    }

    fn handle_datagram(
        &mut self,
        passive: &mut Passive,
        datagram: &[u8],
        sender_addr: net::SocketAddr,
    ) {
        let segment = match Segment::decode(datagram) {
            Ok(segment) => segment,
            Err(err) => {
                tracing::trace!("dropped datagram from {}: {}", sender_addr, err);
                return;
            }
        };

        if let Some(peer) = self.peer {
            if peer != sender_addr {
                tracing::trace!("ignoring {} while serving {}", sender_addr, peer);
                return;
            }
        }

        let now_ms = self.time_now_ms();

        passive.handle_segment(&segment, now_ms, &mut PassiveHost::new(self, sender_addr));

        self.peer = match passive.state() {
            PassiveState::Listen => None,
            _ => Some(sender_addr),
        };
    }

    /// Reads and processes as many datagrams as possible from socket_rx without blocking.
    fn handle_datagrams(&mut self, passive: &mut Passive, socket_rx: &mut socket::SocketRx) {
        loop {
            match socket_rx.try_read_datagram() {
                Ok(Some((datagram, sender_addr))) => {
                    self.handle_datagram(passive, datagram, sender_addr);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("receive failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Reads and processes as many datagrams as possible from socket_rx, waiting up to
    /// `wait_timeout` for the first.
    fn handle_datagrams_wait(
        &mut self,
        passive: &mut Passive,
        socket_rx: &mut socket::SocketRx,
        wait_timeout: Option<time::Duration>,
    ) {
        match socket_rx.wait_for_datagram(wait_timeout) {
            Ok(Some((datagram, sender_addr))) => {
                self.handle_datagram(passive, datagram, sender_addr);
                // Process any further datagrams without blocking
                self.handle_datagrams(passive, socket_rx);
            }
            Ok(None) => (),
            Err(err) => {
                tracing::debug!("receive failed: {}", err);
            }
        }
    }
}

impl Server {
    /// Equivalent to calling [`Server::bind_with_config`] with default configuration.
    pub fn bind<A>(bind_addr: A) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::bind_with_config(bind_addr, Default::default())
    }

    /// Binds a UDP socket at the provided address, and returns a new server object. Errors
    /// encountered during socket initialization are forwarded to the caller.
    ///
    /// # Panics
    ///
    /// Panics if the provided configuration is invalid.
    pub fn bind_with_config<A>(bind_addr: A, config: Config) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        // One spare byte so oversized datagrams are detected rather than silently truncated
        let (socket_tx, socket_rx) = socket::new(bind_addr, MTU + 1)?;

        tracing::info!("listening on {}", socket_rx.local_addr());

        let core = ServerCore {
            time_ref: time::Instant::now(),
            socket_tx,
            peer: None,
            impairment: config.impairment.map(Impairment::new),
            events: VecDeque::new(),
        };

        let passive = Passive::new(config.receive_window, 2 * config.timeout_ms);

        Ok(Self {
            core,
            passive,
            socket_rx,
        })
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts in an attempt to produce an event.
    ///
    /// Returns `None` if no events are available.
    pub fn poll_event(&mut self) -> Option<Event> {
        let core = &mut self.core;

        if core.events.is_empty() {
            core.handle_datagrams(&mut self.passive, &mut self.socket_rx);

            core.handle_timeouts(&mut self.passive);
        }

        core.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts until an event can be returned.
    pub fn wait_event(&mut self) -> Event {
        let core = &mut self.core;

        loop {
            if let Some(event) = core.events.pop_front() {
                return event;
            }

            let wait_timeout = core.next_timer_timeout(&self.passive);

            core.handle_datagrams_wait(&mut self.passive, &mut self.socket_rx, wait_timeout);

            core.handle_timeouts(&mut self.passive);
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts until an event can be returned. Waits for a
    /// maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event> {
        let core = &mut self.core;

        if core.events.is_empty() {
            let mut remaining_timeout = timeout;
            let mut wait_begin = time::Instant::now();

            loop {
                let wait_timeout = match core.next_timer_timeout(&self.passive) {
                    Some(timer_timeout) => remaining_timeout.min(timer_timeout),
                    None => remaining_timeout,
                };

                core.handle_datagrams_wait(
                    &mut self.passive,
                    &mut self.socket_rx,
                    Some(wait_timeout),
                );

                core.handle_timeouts(&mut self.passive);

                if !core.events.is_empty() {
                    // Found what we're looking for
                    break;
                }

                let now = time::Instant::now();
                let elapsed_time = now - wait_begin;

                if elapsed_time >= remaining_timeout {
                    // No time left
                    break;
                }

                remaining_timeout -= elapsed_time;
                wait_begin = now;
            }
        }

        core.events.pop_front()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the address of the client currently being served, if any.
    pub fn peer_addr(&self) -> Option<net::SocketAddr> {
        self.core.peer
    }
}
