use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use fcntcp::server;

const EVENT_POLL_INTERVAL: time::Duration = time::Duration::from_millis(50);

/// Completed transfers are expected to arrive within this long
pub const TRANSFER_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// A server running on its own thread, reporting every completed transfer.
pub struct TestServer {
    pub addr: net::SocketAddr,
    pub transfers: mpsc::Receiver<server::Transfer>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn spawn(config: server::Config) -> Self {
        let mut server = server::Server::bind_with_config("127.0.0.1:0", config).unwrap();
        let addr = server.local_addr();

        let (transfer_tx, transfer_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);

            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(server::Event::Finish(transfer)) =
                        server.wait_event_timeout(EVENT_POLL_INTERVAL)
                    {
                        if transfer_tx.send(transfer).is_err() {
                            break;
                        }
                    }
                }
            })
        };

        Self {
            addr,
            transfers: transfer_rx,
            stop,
            thread: Some(thread),
        }
    }

    pub fn next_transfer(&self) -> server::Transfer {
        self.transfers
            .recv_timeout(TRANSFER_TIMEOUT)
            .expect("server did not finish a transfer")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn random_data(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

pub fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// A plain UDP socket for speaking the wire protocol by hand.
pub fn raw_socket(server_addr: net::SocketAddr, read_timeout: time::Duration) -> net::UdpSocket {
    let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.connect(server_addr).unwrap();
    socket.set_read_timeout(Some(read_timeout)).unwrap();
    socket
}

pub fn recv_segment(socket: &net::UdpSocket) -> Option<fcntcp::segment::Segment> {
    let mut buffer = [0u8; fcntcp::segment::MTU];

    let len = socket.recv(&mut buffer).ok()?;

    Some(fcntcp::segment::Segment::decode(&buffer[..len]).unwrap())
}
