//! Line-driven client.
//!
//! Each input line is sent as one NUL-terminated frame; the client then blocks
//! until the whole reply frame has arrived and prints it as `[N] TEXT`, where
//! `N` is the announced reply length.

use crate::protocols::echo::codec::{self, HEADER_LEN};
use std::collections::TryReserveError;
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream};
use tracing::{debug, error, info};

/// Longest reply text printed before it is cut off with `" ..."`.
pub const DISPLAY_LIMIT: usize = 70;

/// Failure of a single request/reply exchange.
#[derive(Debug)]
pub enum ExchangeError {
    /// The request could not be framed; nothing was sent.
    Encode(io::Error),
    WriteLength(io::Error),
    WriteText(io::Error),
    ReadLength(io::Error),
    ReadText(io::Error),
    /// No memory for the announced reply; its bytes were skipped.
    Alloc(TryReserveError),
}

impl ExchangeError {
    /// Whether the stream is unusable for further exchanges.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExchangeError::Encode(_) | ExchangeError::Alloc(_))
    }
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::Encode(e) => write!(f, "Request error: {}", e),
            ExchangeError::WriteLength(e) => write!(f, "Write(length) error: {}", e),
            ExchangeError::WriteText(e) => write!(f, "Write(text) error: {}", e),
            ExchangeError::ReadLength(e) => write!(f, "Read(length) error: {}", e),
            ExchangeError::ReadText(e) => write!(f, "Read(text) error: {}", e),
            ExchangeError::Alloc(e) => write!(f, "Memory allocation error: {}", e),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Connect to `host:port` and run an interactive session on stdin/stdout.
pub fn run(host: &str, port: u16) -> io::Result<()> {
    let mut stream = TcpStream::connect((host, port))?;
    info!(peer = %stream.peer_addr()?, "Connected");

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    session(&mut stream, &mut input, &mut output)?;

    stream.shutdown(Shutdown::Both)?;
    Ok(())
}

/// Prompt, send and print until input ends or the transport breaks.
pub fn session<S, R, W>(stream: &mut S, input: &mut R, output: &mut W) -> io::Result<()>
where
    S: Read + Write,
    R: BufRead,
    W: Write,
{
    let mut line = Vec::new();
    loop {
        write!(output, "> ")?;
        output.flush()?;

        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }

        match exchange(stream, strip_line_ending(&line)) {
            Ok(reply) => writeln!(output, "{}", render_reply(&reply))?,
            Err(e) if e.is_fatal() => {
                error!("{}", e);
                return Ok(());
            }
            Err(e) => error!("{}", e),
        }
    }
}

/// Send `text` plus a NUL terminator as one frame and read one reply frame.
pub fn exchange<S: Read + Write>(stream: &mut S, text: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut payload = Vec::with_capacity(text.len() + 1);
    payload.extend_from_slice(text);
    payload.push(0);

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    codec::encode(&payload, &mut frame).map_err(ExchangeError::Encode)?;

    stream
        .write_all(&frame[..HEADER_LEN])
        .map_err(ExchangeError::WriteLength)?;
    stream
        .write_all(&frame[HEADER_LEN..])
        .and_then(|()| stream.flush())
        .map_err(ExchangeError::WriteText)?;
    debug!(bytes = frame.len(), "Wrote request");

    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .map_err(ExchangeError::ReadLength)?;
    let reply_len = codec::decode_len(header);

    let mut reply = Vec::new();
    if let Err(e) = reply.try_reserve_exact(reply_len) {
        // Skip the body so the next exchange starts on a frame boundary.
        let mut body = Read::by_ref(stream).take(reply_len as u64);
        io::copy(&mut body, &mut io::sink()).map_err(ExchangeError::ReadText)?;
        return Err(ExchangeError::Alloc(e));
    }
    reply.resize(reply_len, 0);
    stream
        .read_exact(&mut reply)
        .map_err(ExchangeError::ReadText)?;
    debug!(bytes = HEADER_LEN + reply_len, "Read reply");

    Ok(reply)
}

/// Format a reply payload for display.
///
/// Shows the announced length and the text up to the first NUL, cut to
/// [`DISPLAY_LIMIT`] bytes.
pub fn render_reply(payload: &[u8]) -> String {
    let text = payload.split(|&b| b == 0).next().unwrap_or_default();
    let shown = &text[..text.len().min(DISPLAY_LIMIT)];

    let mut line = format!("[{}] {}", payload.len(), String::from_utf8_lossy(shown));
    if text.len() > DISPLAY_LIMIT {
        line.push_str(" ...");
    }
    line
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
