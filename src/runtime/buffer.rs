//! Per-connection frame buffers.
//!
//! Receiving is two-phase: a fixed array holds the length prefix, and the body
//! vector is only allocated once that prefix has been read, so a buffer never
//! grows while a read may be pointing into it. Sending drains one encoded
//! reply from front to back.

use crate::protocols::echo::codec::{self, HEADER_LEN};
use std::collections::TryReserveError;

/// Incoming frame being assembled across partial reads.
///
/// `received` and `wanted` count header and body bytes together, so a
/// request of `n` body bytes is complete at `received == wanted == 4 + n`.
#[derive(Debug)]
pub struct RecvBuffer {
    header: [u8; HEADER_LEN],
    body: Vec<u8>,
    /// Body length once the prefix is known.
    body_len: Option<usize>,
    received: usize,
    wanted: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            header: [0; HEADER_LEN],
            body: Vec::new(),
            body_len: None,
            received: 0,
            wanted: HEADER_LEN,
        }
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn wanted(&self) -> usize {
        self.wanted
    }

    /// True once the prefix has been decoded and the body sized.
    pub fn awaiting_body(&self) -> bool {
        self.body_len.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.wanted
    }

    /// The region the next read should land in (`wanted - received` bytes).
    pub fn unfilled(&mut self) -> &mut [u8] {
        if self.received < HEADER_LEN {
            &mut self.header[self.received..]
        } else {
            &mut self.body[self.received - HEADER_LEN..]
        }
    }

    /// Record `n` freshly read bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.received + n <= self.wanted, "read past wanted");
        self.received += n;
    }

    /// Payload length announced by a complete prefix.
    pub fn announced_len(&self) -> usize {
        codec::decode_len(self.header)
    }

    /// Size the body for `len` bytes and extend `wanted` to cover it.
    ///
    /// Leaves the buffer untouched if the allocation fails.
    pub fn begin_body(&mut self, len: usize) -> Result<(), TryReserveError> {
        let mut body = Vec::new();
        body.try_reserve_exact(len)?;
        body.resize(len, 0);

        self.body = body;
        self.body_len = Some(len);
        self.wanted = HEADER_LEN + len;
        Ok(())
    }

    /// Body bytes read so far.
    pub fn body(&self) -> &[u8] {
        &self.body[..self.received.saturating_sub(HEADER_LEN)]
    }

    /// Return to awaiting a length prefix, releasing the body.
    pub fn reset(&mut self) {
        self.body = Vec::new();
        self.body_len = None;
        self.received = 0;
        self.wanted = HEADER_LEN;
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing reply frame; `total` is 0 while idle.
#[derive(Debug, Default)]
pub struct SendBuffer {
    data: Vec<u8>,
    sent: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// Install a fully encoded frame to be sent from its first byte.
    pub fn load(&mut self, frame: Vec<u8>) {
        self.data = frame;
        self.sent = 0;
    }

    /// Bytes not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.sent..]
    }

    /// Record `n` written bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.data.len(), "wrote past total");
        self.sent += n;
    }

    pub fn is_drained(&self) -> bool {
        self.sent == self.data.len()
    }

    pub fn reset(&mut self) {
        self.data = Vec::new();
        self.sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_two_phase() {
        let mut buf = RecvBuffer::new();
        assert_eq!(buf.unfilled().len(), HEADER_LEN);
        assert!(!buf.awaiting_body());

        // Prefix arrives in two pieces.
        buf.unfilled()[..2].copy_from_slice(&[3, 0]);
        buf.advance(2);
        assert_eq!(buf.unfilled().len(), 2);
        buf.unfilled().copy_from_slice(&[0, 0]);
        buf.advance(2);
        assert!(buf.is_complete());
        assert_eq!(buf.announced_len(), 3);

        buf.begin_body(3).unwrap();
        assert!(buf.awaiting_body());
        assert!(!buf.is_complete());
        assert_eq!(buf.wanted(), 7);
        assert_eq!(buf.unfilled().len(), 3);

        buf.unfilled().copy_from_slice(b"hi\0");
        buf.advance(3);
        assert!(buf.is_complete());
        assert_eq!(buf.body(), b"hi\0");

        buf.reset();
        assert_eq!(buf.received(), 0);
        assert_eq!(buf.wanted(), HEADER_LEN);
        assert!(!buf.awaiting_body());
        assert!(buf.body().is_empty());
    }

    #[test]
    fn test_recv_empty_body_is_complete_immediately() {
        let mut buf = RecvBuffer::new();
        buf.unfilled().copy_from_slice(&[0; HEADER_LEN]);
        buf.advance(HEADER_LEN);
        buf.begin_body(0).unwrap();

        assert!(buf.awaiting_body());
        assert!(buf.is_complete());
        assert!(buf.body().is_empty());
        assert!(buf.unfilled().is_empty());
    }

    #[test]
    fn test_send_partial_drain() {
        let mut buf = SendBuffer::new();
        assert_eq!(buf.total(), 0);
        assert!(buf.is_drained());

        buf.load(b"abcdef".to_vec());
        assert_eq!(buf.total(), 6);
        assert!(!buf.is_drained());

        buf.advance(4);
        assert_eq!(buf.pending(), b"ef");
        buf.advance(2);
        assert!(buf.is_drained());

        buf.reset();
        assert_eq!(buf.sent(), 0);
        assert_eq!(buf.total(), 0);
    }
}
