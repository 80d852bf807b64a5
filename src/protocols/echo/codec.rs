//! Echo protocol frame codec.

use bytes::BufMut;
use std::io;

/// Size of the little-endian `u32` length prefix.
pub const HEADER_LEN: usize = 4;

/// Text prepended to every request body to form the reply.
pub const REPLY_PREFIX: &[u8] = b"Echo: ";

/// Encode a payload length as a frame header.
///
/// Fails with `InvalidInput` when the length does not fit the prefix.
pub fn encode_len(len: usize) -> io::Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {len} bytes exceeds the u32 length prefix"),
        )
    })?;
    Ok(len.to_le_bytes())
}

/// Decode a frame header into the payload length it announces.
pub fn decode_len(header: [u8; HEADER_LEN]) -> usize {
    u32::from_le_bytes(header) as usize
}

/// Write one frame (`header` + `payload`) into `out`.
pub fn encode<B: BufMut>(payload: &[u8], out: &mut B) -> io::Result<()> {
    out.put_slice(&encode_len(payload.len())?);
    out.put_slice(payload);
    Ok(())
}

/// Payload length of the reply built from a request body of `body_len` bytes.
pub fn reply_len(body_len: usize) -> usize {
    REPLY_PREFIX.len() + body_len
}

/// Write the framed reply for `body` into `out`.
///
/// The declared request length is authoritative: every body byte is echoed,
/// terminator included, so `"hi\0"` becomes `"Echo: hi\0"`.
pub fn encode_reply<B: BufMut>(body: &[u8], out: &mut B) -> io::Result<()> {
    out.put_slice(&encode_len(reply_len(body.len()))?);
    out.put_slice(REPLY_PREFIX);
    out.put_slice(body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_is_little_endian() {
        assert_eq!(encode_len(3).unwrap(), [3, 0, 0, 0]);
        assert_eq!(encode_len(0x0102_0304).unwrap(), [4, 3, 2, 1]);
        assert_eq!(decode_len([4, 3, 2, 1]), 0x0102_0304);
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode(b"hi\0", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x03\x00\x00\x00hi\0");
    }

    #[test]
    fn test_reply_for_text() {
        let mut buf = Vec::new();
        encode_reply(b"hi\0", &mut buf).unwrap();

        let header: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
        assert_eq!(decode_len(header), 9);
        assert_eq!(&buf[HEADER_LEN..], b"Echo: hi\0");
    }

    #[test]
    fn test_reply_for_empty_line() {
        let mut buf = Vec::new();
        encode_reply(b"\0", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x07\x00\x00\x00Echo: \0");
    }

    #[test]
    fn test_reply_keeps_bytes_past_embedded_nul() {
        let mut buf = Vec::new();
        encode_reply(b"a\0b", &mut buf).unwrap();
        assert_eq!(&buf[HEADER_LEN..], b"Echo: a\0b");
        assert_eq!(reply_len(3), buf.len() - HEADER_LEN);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_oversized_length_rejected() {
        let err = encode_len(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
