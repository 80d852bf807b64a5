//! Echo protocol implementation.
//!
//! Every frame, in both directions, is a little-endian `u32` length followed
//! by exactly that many payload bytes. The server answers each request with
//! `"Echo: "` followed by the request payload, re-framed:
//!
//! ```text
//! Request:  03 00 00 00  'h' 'i' 00
//! Response: 09 00 00 00  'E' 'c' 'h' 'o' ':' ' ' 'h' 'i' 00
//! ```
//!
//! Clients send NUL-terminated text, but the server never relies on the
//! terminator; the announced length decides how many bytes are echoed.
//! A connection carries any number of sequential request/reply exchanges.

pub mod codec;
