use std::io;
use std::net;
use std::sync::Arc;
use std::time;

const SOCKET_POLLING_KEY: usize = 0;

#[derive(Clone)]
pub struct SocketTx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
}

pub struct SocketRx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

#[derive(Clone)]
pub struct ConnectedSocketTx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
}

pub struct ConnectedSocketRx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    peer_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

// The only acceptable error is WouldBlock, indicating no datagram
fn nonblocking<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err),
    }
}

// Blocks until the socket is readable or the timeout elapses. Returns false on timeout or spurious
// wakeup.
fn poll_readable(
    poller: &polling::Poller,
    events: &mut polling::Events,
    socket: &net::UdpSocket,
    timeout: Option<time::Duration>,
) -> io::Result<bool> {
    // Interest must be re-armed prior to each wait() call
    poller.modify(socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

    events.clear();

    let n = poller.wait(events, timeout)?;

    Ok(n > 0)
}

impl SocketTx {
    pub fn send(&self, datagram: &[u8], addr: &net::SocketAddr) {
        if let Err(err) = self.socket.send_to(datagram, addr) {
            tracing::trace!("send to {} failed: {}", addr, err);
        }
    }
}

impl SocketRx {
    fn try_recv(&mut self) -> io::Result<Option<(usize, net::SocketAddr)>> {
        nonblocking(self.socket.recv_from(&mut self.recv_buffer))
    }

    /// If a datagram can be read from the socket, returns the datagram. Returns Ok(None)
    /// otherwise.
    pub fn try_read_datagram(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        Ok(self
            .try_recv()?
            .map(|(len, addr)| (&self.recv_buffer[..len], addr)))
    }

    /// Blocks for a duration of up to `timeout` for an incoming datagram and returns it. Returns
    /// Ok(None) if no datagram could be read in the alloted time, or if polling awoke spuriously.
    pub fn wait_for_datagram(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        let mut received = self.try_recv()?;

        if received.is_none()
            && poll_readable(&self.poller, &mut self.poller_events, &self.socket, timeout)?
        {
            received = self.try_recv()?;
        }

        Ok(received.map(|(len, addr)| (&self.recv_buffer[..len], addr)))
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

/// Binds a non-blocking socket and splits it into send and receive halves. `datagram_size_max`
/// bounds the size of received datagrams; anything larger is truncated.
pub fn new<A>(bind_address: A, datagram_size_max: usize) -> io::Result<(SocketTx, SocketRx)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let local_addr = socket.local_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);

    let tx = SocketTx {
        socket: Arc::clone(&socket_rc),
    };

    let rx = SocketRx {
        socket: socket_rc,
        local_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; datagram_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}

impl ConnectedSocketTx {
    pub fn send(&self, datagram: &[u8]) {
        if let Err(err) = self.socket.send(datagram) {
            tracing::trace!("send failed: {}", err);
        }
    }
}

impl ConnectedSocketRx {
    fn try_recv(&mut self) -> io::Result<Option<usize>> {
        nonblocking(self.socket.recv(&mut self.recv_buffer))
    }

    /// Blocks for a duration of up to `timeout` for an incoming datagram and returns it. Returns
    /// Ok(None) if no datagram could be read in the alloted time, or if polling awoke spuriously.
    pub fn wait_for_datagram(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> io::Result<Option<&[u8]>> {
        let mut received = self.try_recv()?;

        if received.is_none()
            && poll_readable(&self.poller, &mut self.poller_events, &self.socket, timeout)?
        {
            received = self.try_recv()?;
        }

        Ok(received.map(|len| &self.recv_buffer[..len]))
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.peer_addr
    }
}

/// Like [`new`], but the socket only exchanges datagrams with `connect_address`.
pub fn new_connected<A, B>(
    bind_address: A,
    connect_address: B,
    datagram_size_max: usize,
) -> io::Result<(ConnectedSocketTx, ConnectedSocketRx)>
where
    A: net::ToSocketAddrs,
    B: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;
    socket.connect(connect_address)?;

    let local_addr = socket.local_addr()?;
    let peer_addr = socket.peer_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);

    let tx = ConnectedSocketTx {
        socket: Arc::clone(&socket_rc),
    };

    let rx = ConnectedSocketRx {
        socket: socket_rc,
        local_addr,
        peer_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; datagram_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}
