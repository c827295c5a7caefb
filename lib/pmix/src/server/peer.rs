//! One live client connection. The peer owns its socket, its send FIFO and
//! the in-flight transfer state; the server's peer array owns the peer.

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use mio::unix::EventedFd;
use mio::{Poll, PollOpt, Ready, Token};

use crate::logging::{self, Logger};
use crate::status::{PmixResult, Status};
use crate::usock::{Header, RecvMsg, SendMsg, TxError, TxResult, MSG_TYPE_USER};

/// Tokens 0 and 1 belong to the listener and the wake queue.
pub const PEER_TOKEN_BASE: usize = 2;

/// Replies queued beyond this depth mark the peer unresponsive and the
/// connection is closed rather than buffered without bound.
pub const MAX_SEND_BACKLOG: usize = 1024;

pub struct Peer {
    pub index: usize,
    pub stream: UnixStream,
    pub ns_idx: usize,
    pub nspace: String,
    pub rank: i32,
    send_queue: VecDeque<SendMsg>,
    in_send: Option<SendMsg>,
    in_recv: RecvMsg,
    /// Cleared on finalize/abort; no further requests are read.
    pub read_enabled: bool,
    registered: bool,
    log: Logger,
}

impl Peer {
    pub fn new(
        index: usize,
        stream: UnixStream,
        ns_idx: usize,
        nspace: String,
        rank: i32,
        log: &Logger,
    ) -> Peer {
        let log = log.new(logging::o!("peer" => index, "rank" => rank));
        Peer {
            index,
            stream,
            ns_idx,
            nspace,
            rank,
            send_queue: VecDeque::new(),
            in_send: None,
            in_recv: RecvMsg::new(),
            read_enabled: true,
            registered: false,
            log,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        Token(self.index + PEER_TOKEN_BASE)
    }

    fn interest(&self) -> Ready {
        let mut ready = Ready::empty();
        if self.read_enabled {
            ready = ready | Ready::readable();
        }
        if self.in_send.is_some() || !self.send_queue.is_empty() {
            ready = ready | Ready::writable();
        }
        ready
    }

    /// Registers or re-registers the socket with the current interest set.
    /// The write side is only armed while output is pending.
    pub fn update_registration(&mut self, poll: &Poll) -> PmixResult<()> {
        let fd = self.stream.as_raw_fd();
        let result = if self.registered {
            poll.reregister(&EventedFd(&fd), self.token(), self.interest(), PollOpt::level())
        } else {
            poll.register(&EventedFd(&fd), self.token(), self.interest(), PollOpt::level())
        };
        self.registered = true;
        result.map_err(|_| Status::Error)
    }

    pub fn deregister(&mut self, poll: &Poll) {
        if self.registered {
            let fd = self.stream.as_raw_fd();
            let _ = poll.deregister(&EventedFd(&fd));
            self.registered = false;
        }
    }

    /// Frames a reply on the peer's FIFO under the caller's tag.
    pub fn queue_reply(&mut self, tag: u32, payload: Vec<u8>) -> PmixResult<()> {
        if self.send_queue.len() >= MAX_SEND_BACKLOG {
            logging::warn!(self.log, "send backlog exceeded, dropping peer";
                           "queued" => self.send_queue.len());
            return Err(Status::ResourceBusy);
        }
        let hdr = Header::new(
            self.index as u64,
            MSG_TYPE_USER,
            tag,
            payload.len() as u64,
        );
        self.send_queue.push_back(SendMsg::new(hdr, payload));
        logging::trace!(self.log, "queued reply"; "tag" => tag);
        Ok(())
    }

    /// Drives the in-flight send and then the FIFO until the socket blocks
    /// or everything is out. `Ok` means the queue drained.
    pub fn pump_send(&mut self) -> TxResult<()> {
        loop {
            let mut msg = match self.in_send.take() {
                Some(msg) => msg,
                None => match self.send_queue.pop_front() {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };
            match msg.advance(&mut self.stream) {
                Ok(()) => {
                    logging::trace!(self.log, "reply sent"; "tag" => msg.tag());
                    continue;
                }
                Err(TxError::Wait) => {
                    self.in_send = Some(msg);
                    return Err(TxError::Wait);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Advances the in-flight receive; a completed message is handed back
    /// for dispatch.
    pub fn pump_recv(&mut self) -> TxResult<(Header, Vec<u8>)> {
        self.in_recv.advance(&mut self.stream)
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        self.in_send.is_some() || !self.send_queue.is_empty()
    }

    /// Tears the connection down. Pending sends targeted a peer that no
    /// longer exists, so the queue is discarded.
    pub fn close(mut self, poll: &Poll) {
        self.deregister(poll);
        self.send_queue.clear();
        self.in_send = None;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        logging::debug!(self.log, "peer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    fn test_peer() -> (Peer, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let peer = Peer::new(0, local, 0, "job".into(), 3, &crate::logging::discard());
        (peer, remote)
    }

    #[test]
    fn test_queue_and_pump() {
        let (mut peer, remote) = test_peer();

        peer.queue_reply(7, vec![1, 2, 3]).unwrap();
        assert!(peer.has_egress());
        peer.pump_send().unwrap();
        assert!(!peer.has_egress());

        use std::io::Read;
        let mut wire = vec![0u8; crate::usock::HEADER_SIZE + 3];
        (&remote).read_exact(&mut wire).unwrap();
        let hdr_raw: [u8; crate::usock::HEADER_SIZE] =
            wire[..crate::usock::HEADER_SIZE].try_into().unwrap();
        let hdr = Header::read_from(&hdr_raw);
        assert_eq!(hdr.tag, 7);
        assert_eq!(hdr.nbytes, 3);
        assert_eq!(&wire[crate::usock::HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn test_backlog_cap() {
        let (mut peer, _remote) = test_peer();
        for i in 0..MAX_SEND_BACKLOG {
            peer.queue_reply(i as u32, Vec::new()).unwrap();
        }
        assert_eq!(
            peer.queue_reply(0, Vec::new()),
            Err(Status::ResourceBusy)
        );
    }

    #[test]
    fn test_recv_detects_close() {
        let (mut peer, remote) = test_peer();
        drop(remote);
        assert_eq!(peer.pump_recv(), Err(TxError::Closed));
    }
}
