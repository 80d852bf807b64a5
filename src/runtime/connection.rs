//! Connection state machine for a single client socket.
//!
//! A connection alternates between assembling one length-prefixed request and
//! draining the reply built from it, then starts over on the same socket. It
//! owns its stream: closing drops the stream, so the descriptor is released
//! exactly once no matter which path ends the connection.
//!
//! The state machine is generic over the stream and knows nothing about the
//! readiness backend driving it; the event loop only asks for its interest and
//! calls [`Connection::receive_step`] / [`Connection::send_step`].

use super::buffer::{RecvBuffer, SendBuffer};
use crate::protocols::echo::codec;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tracing::{debug, trace, warn};

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Reading the 4-byte length prefix.
    AwaitLen,
    /// Reading the announced body.
    AwaitBody,
    /// Reply built, not yet fully written.
    ReplyPending,
    /// Terminal.
    Closed,
}

/// Outcome of a single receive or send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The step made progress (or was interrupted) and may be attempted again.
    Continue,
    /// Nothing to do until the next readiness signal.
    Blocked,
    /// The connection is closed.
    Closed,
}

/// Readiness a connection currently wants to be told about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        writable: false,
    };
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S: AsFd> {
    fd: RawFd,
    /// `None` once closed.
    stream: Option<S>,
    recv: RecvBuffer,
    send: SendBuffer,
    max_payload: usize,
}

impl<S: AsFd> Connection<S> {
    /// Wrap an accepted stream, awaiting its first length prefix.
    pub fn new(stream: S, max_payload: usize) -> Self {
        Self {
            fd: stream.as_fd().as_raw_fd(),
            stream: Some(stream),
            recv: RecvBuffer::new(),
            send: SendBuffer::new(),
            max_payload,
        }
    }

    /// Descriptor the connection was created with. Stays stable after close.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn can_receive(&self) -> bool {
        self.is_active() && self.recv.received() < self.recv.wanted()
    }

    pub fn can_send(&self) -> bool {
        self.is_active() && self.send.sent() < self.send.total()
    }

    pub fn interest(&self) -> Readiness {
        Readiness {
            readable: self.can_receive(),
            writable: self.can_send(),
        }
    }

    pub fn phase(&self) -> ConnPhase {
        if !self.is_active() {
            ConnPhase::Closed
        } else if self.send.total() > 0 {
            ConnPhase::ReplyPending
        } else if self.recv.awaiting_body() {
            ConnPhase::AwaitBody
        } else {
            ConnPhase::AwaitLen
        }
    }

    pub fn received(&self) -> usize {
        self.recv.received()
    }

    pub fn wanted(&self) -> usize {
        self.recv.wanted()
    }

    pub fn sent(&self) -> usize {
        self.send.sent()
    }

    pub fn total(&self) -> usize {
        self.send.total()
    }

    /// The live stream, for readiness registration.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Shut down and release the socket. Does nothing if already closed.
    pub fn close(&mut self) {
        let phase = self.phase();
        let (received, sent) = (self.received(), self.sent());
        if let Some(stream) = self.stream.take() {
            if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
                // Usually ENOTCONN after the peer went away first.
                trace!(fd = self.fd, error = %e, "Shutdown error");
            }
            drop(stream);
            debug!(fd = self.fd, ?phase, received, sent, "Connection closed");
        }
    }
}

impl<S: Read + Write + AsFd> Connection<S> {
    /// Attempt one non-blocking read of the outstanding request bytes.
    pub fn receive_step(&mut self) -> Step {
        if !self.can_receive() {
            return self.idle_step();
        }
        let Some(stream) = self.stream.as_mut() else {
            return Step::Closed;
        };

        let n = match stream.read(self.recv.unfilled()) {
            Ok(0) => {
                trace!(fd = self.fd, "Peer closed");
                self.close();
                return Step::Closed;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Blocked,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
            Err(e) => {
                warn!(fd = self.fd, error = %e, "Read error");
                self.close();
                return Step::Closed;
            }
        };

        self.recv.advance(n);
        trace!(
            fd = self.fd,
            bytes = n,
            received = self.received(),
            wanted = self.wanted(),
            "Read"
        );

        if !self.recv.is_complete() {
            return Step::Continue;
        }

        if !self.recv.awaiting_body() {
            let len = self.recv.announced_len();
            if len > self.max_payload {
                warn!(
                    fd = self.fd,
                    len,
                    max_payload = self.max_payload,
                    "Frame exceeds max payload"
                );
                self.close();
                return Step::Closed;
            }
            if let Err(e) = self.recv.begin_body(len) {
                warn!(fd = self.fd, len, error = %e, "Failed to allocate request body");
                self.close();
                return Step::Closed;
            }
            // An empty body is complete as soon as its prefix is.
            if len > 0 {
                return Step::Continue;
            }
        }

        self.prepare_reply()
    }

    /// Attempt one non-blocking write of the outstanding reply bytes.
    pub fn send_step(&mut self) -> Step {
        if !self.can_send() {
            return self.idle_step();
        }
        let Some(stream) = self.stream.as_mut() else {
            return Step::Closed;
        };

        let n = match stream.write(self.send.pending()) {
            Ok(0) => {
                debug!(fd = self.fd, "Write returned 0");
                self.close();
                return Step::Closed;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Blocked,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
            Err(e) => {
                warn!(fd = self.fd, error = %e, "Write error");
                self.close();
                return Step::Closed;
            }
        };

        self.send.advance(n);
        trace!(
            fd = self.fd,
            bytes = n,
            sent = self.sent(),
            total = self.total(),
            "Wrote"
        );

        if self.send.is_drained() {
            // Keep-alive: wait for the next request on the same socket.
            self.recv.reset();
            self.send.reset();
        }
        Step::Continue
    }

    fn idle_step(&self) -> Step {
        if self.is_active() {
            Step::Blocked
        } else {
            Step::Closed
        }
    }

    /// Encode the reply for the completed request into the send buffer.
    fn prepare_reply(&mut self) -> Step {
        let body = self.recv.body();
        let mut frame = Vec::new();
        let encoded = frame
            .try_reserve_exact(codec::HEADER_LEN + codec::reply_len(body.len()))
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))
            .and_then(|()| codec::encode_reply(body, &mut frame));

        match encoded {
            Ok(()) => {
                trace!(fd = self.fd, total = frame.len(), "Reply ready");
                self.send.load(frame);
                Step::Continue
            }
            Err(e) => {
                warn!(fd = self.fd, error = %e, "Failed to build reply");
                self.close();
                Step::Closed
            }
        }
    }
}

impl<S: AsFd> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}
