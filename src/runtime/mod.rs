//! Single-threaded readiness runtime.
//!
//! Layers, leaf-first:
//! - `buffer`: two-phase receive buffer and reply send buffer
//! - `connection`: per-socket request/reply state machine
//! - `table`: descriptor-indexed connection ownership and dispatch
//! - `event_loop`: mio poll loop (epoll on Linux, kqueue on macOS)
//!
//! The connection state machine and the table's dispatch contract are
//! independent of mio; only `event_loop` knows how readiness is obtained.

mod buffer;
mod connection;
mod event_loop;
mod table;

use crate::config::Config;
use event_loop::EventLoop;
use tracing::info;

/// Bind the listener and serve until the process exits.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config)?;
    info!(
        addr = %event_loop.local_addr()?,
        max_connections = config.max_connections,
        "Listening"
    );
    event_loop.run()
}
