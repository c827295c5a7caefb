//! Non-blocking send and receive state machines. One message is in flight
//! per direction; partial transfers park the cursor and resume when the
//! event loop reports readiness again.

use std::io::{self, Read, Write};

use crate::status::Status;
use crate::usock::{Header, TxError, TxResult, HEADER_SIZE, MAX_MSG_PAYLOAD};

/// An outbound message: header bytes first, then the payload. `hdr_sent`
/// latches once the header is fully written.
#[derive(Debug)]
pub struct SendMsg {
    hdr: Header,
    hdr_raw: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    hdr_sent: bool,
    cursor: usize,
}

impl SendMsg {
    pub fn new(hdr: Header, payload: Vec<u8>) -> SendMsg {
        debug_assert_eq!(hdr.nbytes as usize, payload.len());
        let mut hdr_raw = [0u8; HEADER_SIZE];
        hdr.write_to(&mut hdr_raw);
        SendMsg {
            hdr,
            hdr_raw,
            payload,
            hdr_sent: false,
            cursor: 0,
        }
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.hdr.tag
    }

    /// Drives the transfer forward. `Ok(())` means the whole message went
    /// out; `Err(Wait)` parks the message for the next writable event.
    pub fn advance<W: Write>(&mut self, stream: &mut W) -> TxResult<()> {
        if !self.hdr_sent {
            self.write_span(stream, true)?;
            self.hdr_sent = true;
            self.cursor = 0;
        }
        // A zero-byte payload completes with the header.
        if !self.payload.is_empty() {
            self.write_span(stream, false)?;
        }
        Ok(())
    }

    fn write_span<W: Write>(&mut self, stream: &mut W, header: bool) -> TxResult<()> {
        let src: &[u8] = if header { &self.hdr_raw } else { &self.payload };
        while self.cursor < src.len() {
            match stream.write(&src[self.cursor..]) {
                Ok(0) => return Err(TxError::Fatal(Status::CommFailure)),
                Ok(n) => self.cursor += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TxError::Wait);
                }
                Err(_) => return Err(TxError::Fatal(Status::CommFailure)),
            }
        }
        Ok(())
    }
}

/// An inbound message: the header is accumulated first (`hdr_recvd`
/// latches), then a payload of exactly `nbytes` bytes.
#[derive(Debug)]
pub struct RecvMsg {
    hdr_raw: [u8; HEADER_SIZE],
    hdr: Option<Header>,
    payload: Vec<u8>,
    cursor: usize,
}

impl RecvMsg {
    pub fn new() -> RecvMsg {
        RecvMsg {
            hdr_raw: [0u8; HEADER_SIZE],
            hdr: None,
            payload: Vec::new(),
            cursor: 0,
        }
    }

    #[inline]
    pub fn hdr_recvd(&self) -> bool {
        self.hdr.is_some()
    }

    /// Drives the transfer forward, returning the completed message. A
    /// zero-length read means the peer closed the connection.
    pub fn advance<R: Read>(&mut self, stream: &mut R) -> TxResult<(Header, Vec<u8>)> {
        if self.hdr.is_none() {
            self.read_header(stream)?;
        }
        // hdr is now latched
        let hdr = self.hdr.expect("Header must be latched");
        while self.cursor < self.payload.len() {
            let cursor = self.cursor;
            match stream.read(&mut self.payload[cursor..]) {
                Ok(0) => return Err(TxError::Closed),
                Ok(n) => self.cursor += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TxError::Wait);
                }
                Err(_) => return Err(TxError::Fatal(Status::CommFailure)),
            }
        }
        let payload = std::mem::replace(&mut self.payload, Vec::new());
        self.hdr = None;
        self.cursor = 0;
        Ok((hdr, payload))
    }

    fn read_header<R: Read>(&mut self, stream: &mut R) -> TxResult<()> {
        while self.cursor < HEADER_SIZE {
            let cursor = self.cursor;
            match stream.read(&mut self.hdr_raw[cursor..]) {
                Ok(0) => return Err(TxError::Closed),
                Ok(n) => self.cursor += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TxError::Wait);
                }
                Err(_) => return Err(TxError::Fatal(Status::CommFailure)),
            }
        }
        let hdr = Header::read_from(&self.hdr_raw);
        if hdr.nbytes > MAX_MSG_PAYLOAD {
            return Err(TxError::Fatal(Status::BadParam));
        }
        self.payload = vec![0u8; hdr.nbytes as usize];
        self.cursor = 0;
        self.hdr = Some(hdr);
        Ok(())
    }
}
