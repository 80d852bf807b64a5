//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection table performs the non-blocking reads and writes. Uses epoll on
//! Linux, kqueue on macOS.
//!
//! Each turn:
//! 1. re-derives every connection's interest from its state machine and
//!    brings the poll registry in line with it,
//! 2. waits for readiness, bounded by the poll timeout,
//! 3. accepts pending connections, then services ready connections in
//!    ascending descriptor order.
//!
//! Nothing that happens inside a turn is fatal: failures are scoped to one
//! connection or one accept attempt.

use super::connection::Readiness;
use super::table::ConnectionTable;
use crate::config::Config;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness reported for one connection during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ready {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

/// Single-threaded server loop owning the listener and every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    table: ConnectionTable<TcpStream>,
    timeout: Duration,
    ready: Vec<Ready>,
    /// An accept failed before the queue was drained. The listener's edge is
    /// spent, so accepting is retried every turn until it would block.
    accept_stalled: bool,
}

impl EventLoop {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            table: ConnectionTable::new(config.max_connections, config.max_payload),
            timeout: config.poll_timeout(),
            ready: Vec::with_capacity(config.events_capacity),
            accept_stalled: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.turn();
        }
    }

    /// Run one iteration: sync interests, wait, accept, dispatch.
    pub fn turn(&mut self) {
        self.sync_interests();

        match self.poll.poll(&mut self.events, Some(self.timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                error!(error = %e, "Poll error");
                return;
            }
        }

        if self.events.is_empty() {
            trace!(connections = self.table.len(), "Poll timeout");
        }

        let mut accept = self.accept_stalled;
        self.ready.clear();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept = true,
                Token(index) => {
                    let Ok(fd) = RawFd::try_from(index) else {
                        continue;
                    };
                    self.ready.push(Ready {
                        fd,
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                    });
                }
            }
        }

        if accept {
            self.accept_pending();
        }

        merge_ready(&mut self.ready);
        for ready in &self.ready {
            self.table.dispatch(ready.fd, ready.readable, ready.writable);
        }
    }

    /// Accept until the listen queue is empty.
    fn accept_pending(&mut self) {
        if self.accept_stalled {
            trace!("Retrying stalled accept");
        }
        self.accept_stalled = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.table.admit(stream) {
                    Ok(fd) => debug!(fd, peer = %peer, "Accepted connection"),
                    Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_stalled = true;
                    break;
                }
            }
        }
    }

    /// Drop closed connections and (re/de)register the rest so the registry
    /// watches exactly what each connection can currently do.
    fn sync_interests(&mut self) {
        let reaped = self.table.reap();
        if reaped > 0 {
            trace!(reaped, connections = self.table.len(), "Reaped closed connections");
        }
        if self.table.is_empty() {
            return;
        }

        let registry = self.poll.registry();
        for (fd, slot) in self.table.iter_mut() {
            let wanted = slot.conn.interest();
            if wanted == slot.registered {
                continue;
            }
            let Some(stream) = slot.conn.stream_mut() else {
                continue;
            };

            let token = Token(fd as usize);
            let result = match (to_mio(slot.registered), to_mio(wanted)) {
                (None, Some(interest)) => registry.register(stream, token, interest),
                (Some(_), Some(interest)) => registry.reregister(stream, token, interest),
                (Some(_), None) => registry.deregister(stream),
                (None, None) => Ok(()),
            };

            match result {
                Ok(()) => slot.registered = wanted,
                Err(e) => {
                    warn!(fd, error = %e, "Failed to update interest");
                    slot.conn.close();
                }
            }
        }
    }
}

/// Order ready connections by descriptor, folding duplicate entries for the
/// same descriptor into one. kqueue reports read and write readiness as
/// separate events.
fn merge_ready(ready: &mut Vec<Ready>) {
    ready.sort_unstable_by_key(|ready| ready.fd);
    ready.dedup_by(|later, kept| {
        if later.fd == kept.fd {
            kept.readable |= later.readable;
            kept.writable |= later.writable;
            true
        } else {
            false
        }
    });
}

fn to_mio(readiness: Readiness) -> Option<Interest> {
    match (readiness.readable, readiness.writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread::{self, JoinHandle};

    struct TestServer {
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl TestServer {
        fn start(max_connections: usize) -> Self {
            let config = Config {
                port: 0,
                max_connections,
                poll_timeout_ms: 20,
                ..Config::default()
            };
            let stop = Arc::new(AtomicBool::new(false));
            let (tx, rx) = mpsc::channel();

            let flag = Arc::clone(&stop);
            let handle = thread::spawn(move || {
                let mut event_loop = EventLoop::bind(&config).unwrap();
                tx.send(event_loop.local_addr().unwrap()).unwrap();
                while !flag.load(Ordering::Relaxed) {
                    event_loop.turn();
                }
            });

            let addr = rx.recv().unwrap();
            Self {
                addr,
                stop,
                handle: Some(handle),
            }
        }

        fn connect(&self) -> StdTcpStream {
            let stream = StdTcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    #[test]
    fn test_echo_over_tcp() {
        let server = TestServer::start(1024);
        let mut stream = server.connect();

        let reply = client::exchange(&mut stream, b"hi").unwrap();
        assert_eq!(reply, b"Echo: hi\0");
        assert_eq!(client::render_reply(&reply), "[9] Echo: hi");

        let reply = client::exchange(&mut stream, b"").unwrap();
        assert_eq!(reply, b"Echo: \0");
    }

    #[test]
    fn test_pipelined_requests() {
        use std::io::{Read, Write};

        let server = TestServer::start(1024);
        let mut stream = server.connect();

        let mut batch = Vec::new();
        for text in [&b"a\0"[..], b"bb\0", b"ccc\0"] {
            crate::protocols::echo::codec::encode(text, &mut batch).unwrap();
        }
        stream.write_all(&batch).unwrap();

        for expected in [&b"Echo: a\0"[..], b"Echo: bb\0", b"Echo: ccc\0"] {
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).unwrap();
            let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
            stream.read_exact(&mut payload).unwrap();
            assert_eq!(payload, expected);
        }
    }

    #[test]
    fn test_many_clients() {
        let server = TestServer::start(1024);
        let mut streams: Vec<StdTcpStream> = (0..8).map(|_| server.connect()).collect();

        for round in 0..3 {
            for (i, stream) in streams.iter_mut().enumerate() {
                let text = format!("client {i} round {round}");
                let reply = client::exchange(stream, text.as_bytes()).unwrap();
                assert_eq!(reply, format!("Echo: {text}\0").into_bytes());
            }
        }
    }

    #[test]
    fn test_zero_capacity_rejects_connections() {
        use std::io::Read;

        let server = TestServer::start(0);
        let mut stream = server.connect();

        // The server closes the socket without reading anything: either an
        // orderly EOF or a reset, never a read timeout.
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert!(
                !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "server kept the connection open: {e}"
            ),
        }
    }

    #[test]
    fn test_stalled_accept_retried_without_listener_event() {
        let config = Config {
            port: 0,
            poll_timeout_ms: 20,
            ..Config::default()
        };
        let mut event_loop = EventLoop::bind(&config).unwrap();
        let addr = event_loop.local_addr().unwrap();

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Swallow the listener's readiness edge as a failed accept would,
        // leaving the connection queued in the backlog.
        let mut seen = false;
        for _ in 0..50 {
            event_loop
                .poll
                .poll(&mut event_loop.events, Some(Duration::from_millis(20)))
                .unwrap();
            if event_loop.events.iter().any(|e| e.token() == LISTENER_TOKEN) {
                seen = true;
                break;
            }
        }
        assert!(seen);
        event_loop.accept_stalled = true;

        event_loop.turn();
        assert_eq!(event_loop.table.len(), 1);
        assert!(!event_loop.accept_stalled);

        let text = b"after stall\0";
        let mut request = Vec::new();
        crate::protocols::echo::codec::encode(text, &mut request).unwrap();
        {
            use std::io::Write;
            stream.write_all(&request).unwrap();
        }

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            use std::io::Read;
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).unwrap();
            let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
            stream.read_exact(&mut payload).unwrap();
            tx.send(payload).unwrap();
        });

        let mut reply = None;
        for _ in 0..250 {
            event_loop.turn();
            if let Ok(payload) = rx.try_recv() {
                reply = Some(payload);
                break;
            }
        }
        reader.join().unwrap();
        assert_eq!(reply.unwrap(), b"Echo: after stall\0");
    }

    #[test]
    fn test_merge_ready_orders_and_folds() {
        let ready = |fd, readable, writable| Ready {
            fd,
            readable,
            writable,
        };
        let mut events = vec![
            ready(9, false, true),
            ready(4, true, false),
            ready(9, true, false),
            ready(6, true, false),
            ready(4, false, false),
        ];

        merge_ready(&mut events);
        assert_eq!(
            events,
            vec![
                ready(4, true, false),
                ready(6, true, false),
                ready(9, true, true),
            ]
        );

        let mut empty = Vec::new();
        merge_ready(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_to_mio() {
        assert_eq!(to_mio(Readiness::NONE), None);
        assert_eq!(
            to_mio(Readiness { readable: true, writable: false }),
            Some(Interest::READABLE)
        );
        assert_eq!(
            to_mio(Readiness { readable: false, writable: true }),
            Some(Interest::WRITABLE)
        );
    }
}
