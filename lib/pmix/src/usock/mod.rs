//! Unix-socket message framing: the fixed header layout, blocking transfer
//! helpers for the handshake, and the rendezvous path contract.

pub mod sendrecv;

pub use self::sendrecv::{RecvMsg, SendMsg};

use byteorder::{BigEndian, ByteOrder};
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::status::{PmixResult, Status};

/// Handshake identification frame.
pub const MSG_TYPE_IDENT: u8 = 1;
/// Tagged command/reply frame.
pub const MSG_TYPE_USER: u8 = 2;

/// Bytes of the on-wire header; the fields are packed with no padding.
pub const HEADER_SIZE: usize = 21;

/// Ceiling on the handshake payload, guarding against memory-exhaustion
/// attacks from unauthenticated sockets.
pub const MAX_IDENT_PAYLOAD: u64 = 65536;

/// Ceiling on a single user message payload.
pub const MAX_MSG_PAYLOAD: u64 = 1 << 26;

/// Fixed-layout preamble of every message. All multi-byte fields travel in
/// network byte order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    /// Peer identity during the handshake, server-assigned index afterward.
    pub id: u64,
    pub msg_type: u8,
    pub tag: u32,
    pub nbytes: u64,
}

impl Header {
    #[inline]
    pub fn new(id: u64, msg_type: u8, tag: u32, nbytes: u64) -> Header {
        Header {
            id,
            msg_type,
            tag,
            nbytes,
        }
    }

    pub fn write_to(&self, raw: &mut [u8; HEADER_SIZE]) {
        BigEndian::write_u64(&mut raw[0..8], self.id);
        raw[8] = self.msg_type;
        BigEndian::write_u32(&mut raw[9..13], self.tag);
        BigEndian::write_u64(&mut raw[13..21], self.nbytes);
    }

    pub fn read_from(raw: &[u8; HEADER_SIZE]) -> Header {
        Header {
            id: BigEndian::read_u64(&raw[0..8]),
            msg_type: raw[8],
            tag: BigEndian::read_u32(&raw[9..13]),
            nbytes: BigEndian::read_u64(&raw[13..21]),
        }
    }
}

/// Transfer-level error plumbing for the non-blocking state machines. `Wait`
/// yields back to the event loop, `Closed` marks an orderly peer shutdown,
/// and `Fatal` tears the connection down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxError {
    Wait,
    Closed,
    Fatal(Status),
}

pub type TxResult<T> = Result<T, TxError>;

impl From<io::Error> for TxError {
    fn from(err: io::Error) -> TxError {
        match err.kind() {
            io::ErrorKind::WouldBlock => TxError::Wait,
            _ => TxError::Fatal(Status::CommFailure),
        }
    }
}

/// Writes the whole slice, retrying interrupted and would-block results.
/// Only used while the socket is still in blocking mode.
pub fn send_blocking<W: Write>(stream: &mut W, mut bytes: &[u8]) -> PmixResult<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(Status::Unreach),
            Ok(n) => bytes = &bytes[n..],
            Err(ref err)
                if err.kind() == io::ErrorKind::Interrupted
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(_) => return Err(Status::CommFailure),
        }
    }
    Ok(())
}

/// Fills the whole slice, retrying interrupted and would-block results.
pub fn recv_blocking<R: Read>(stream: &mut R, mut bytes: &mut [u8]) -> PmixResult<()> {
    while !bytes.is_empty() {
        match stream.read(bytes) {
            Ok(0) => return Err(Status::Unreach),
            Ok(n) => bytes = &mut bytes[n..],
            Err(ref err)
                if err.kind() == io::ErrorKind::Interrupted
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(_) => return Err(Status::CommFailure),
        }
    }
    Ok(())
}

/// Receives one complete header in blocking mode.
pub fn recv_header_blocking<R: Read>(stream: &mut R) -> PmixResult<Header> {
    let mut raw = [0u8; HEADER_SIZE];
    recv_blocking(stream, &mut raw)?;
    Ok(Header::read_from(&raw))
}

/// Sends a header plus payload in blocking mode.
pub fn send_msg_blocking<W: Write>(stream: &mut W, hdr: Header, payload: &[u8]) -> PmixResult<()> {
    let mut raw = [0u8; HEADER_SIZE];
    hdr.write_to(&mut raw);
    send_blocking(stream, &raw)?;
    send_blocking(stream, payload)
}

/// Rendezvous socket path: `<tmpdir>/pmix-<pid>`, with the temporary
/// directory resolved from TMPDIR, TEMP, TMP, then `/tmp`.
pub fn rendezvous_path(pid: u32) -> PathBuf {
    let tmpdir = env::var("TMPDIR")
        .or_else(|_| env::var("TEMP"))
        .or_else(|_| env::var("TMP"))
        .unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(tmpdir).join(format!("pmix-{}", pid))
}

/// Server URI handed to children: `<pid>:<socket-path>`.
pub fn server_uri(pid: u32, path: &std::path::Path) -> String {
    format!("{}:{}", pid, path.display())
}

/// Splits a server URI back into its pid and socket path.
pub fn parse_uri(uri: &str) -> PmixResult<(u32, PathBuf)> {
    let sep = uri.find(':').ok_or(Status::BadParam)?;
    let pid = uri[..sep].parse::<u32>().map_err(|_| Status::BadParam)?;
    let path = PathBuf::from(&uri[sep + 1..]);
    if path.as_os_str().is_empty() {
        return Err(Status::BadParam);
    }
    Ok((pid, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let hdr = Header::new(0x0102_0304_0506_0708, MSG_TYPE_USER, 0xaabbccdd, 42);
        let mut raw = [0u8; HEADER_SIZE];
        hdr.write_to(&mut raw);

        assert_eq!(&raw[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(raw[8], MSG_TYPE_USER);
        assert_eq!(&raw[9..13], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&raw[13..21], &[0, 0, 0, 0, 0, 0, 0, 42]);

        assert_eq!(Header::read_from(&raw), hdr);
    }

    #[test]
    fn test_blocking_roundtrip() {
        let mut sink = Vec::new();
        send_msg_blocking(
            &mut sink,
            Header::new(7, MSG_TYPE_IDENT, 0, 3),
            &[1, 2, 3],
        )
        .unwrap();
        assert_eq!(sink.len(), HEADER_SIZE + 3);

        let mut cursor = Cursor::new(sink);
        let hdr = recv_header_blocking(&mut cursor).unwrap();
        assert_eq!(hdr.id, 7);
        assert_eq!(hdr.nbytes, 3);
        let mut payload = [0u8; 3];
        recv_blocking(&mut cursor, &mut payload).unwrap();
        assert_eq!(payload, [1, 2, 3]);
    }

    #[test]
    fn test_recv_blocking_short_stream() {
        let mut cursor = Cursor::new(vec![1u8, 2]);
        let mut out = [0u8; 4];
        assert_eq!(recv_blocking(&mut cursor, &mut out), Err(Status::Unreach));
    }

    #[test]
    fn test_uri_roundtrip() {
        let path = PathBuf::from("/tmp/pmix-1234");
        let uri = server_uri(1234, &path);
        assert_eq!(uri, "1234:/tmp/pmix-1234");
        let (pid, parsed) = parse_uri(&uri).unwrap();
        assert_eq!(pid, 1234);
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_uri_rejects_garbage() {
        assert_eq!(parse_uri("no-separator"), Err(Status::BadParam));
        assert_eq!(parse_uri("abc:/tmp/x"), Err(Status::BadParam));
        assert_eq!(parse_uri("12:"), Err(Status::BadParam));
    }
}
