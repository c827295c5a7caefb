//! The in-node PMIx server: rendezvous listener, peer handshake, command
//! dispatch, KV aggregation and collective tracking, all driven by one
//! progress thread.

pub mod dispatcher;
pub mod host;
pub mod kvstore;
pub mod nodemap;
pub mod peer;
pub mod publish;
pub mod registry;
pub mod tracker;

pub use self::host::{FenceDone, GetDone, Host, OpDone, SelfHost, SpawnDone};

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Instant;

use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::codec::{self, BufKind, Buffer};
use crate::event::{wake_pair, Timers, WakeQueue, Waker};
use crate::logging::{self, Logger};
use crate::server::kvstore::KvStore;
use crate::server::peer::{Peer, PEER_TOKEN_BASE};
use crate::server::publish::Directory;
use crate::server::registry::Registry;
use crate::server::tracker::{CollectiveKind, LocalPart, Trackers};
use crate::status::{PmixResult, Status};
use crate::types::{Info, ModexData, Range, Scope};
use crate::usock::{self, Header, TxError, MAX_IDENT_PAYLOAD, MSG_TYPE_IDENT};
use crate::{version_matches, VERSION};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

pub type CredValidator = Box<dyn Fn(&[u8]) -> Status + Send>;
pub type HandshakeHook = Box<dyn Fn(&mut UnixStream) -> Status + Send>;

pub struct ServerConfig {
    pub security_mode: String,
    /// Overrides the pid-derived rendezvous path. Embedding hosts running
    /// several servers in one process need distinct paths.
    pub rendezvous: Option<PathBuf>,
    /// Optional credential validator run against the handshake's opaque
    /// credential bytes.
    pub validate_cred: Option<CredValidator>,
    /// Optional post-status secondary challenge. When present the server
    /// answers `ReadyForHandshake` and runs the hook before admitting the
    /// peer.
    pub server_handshake: Option<HandshakeHook>,
    pub debug_verbosity: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            security_mode: "native".to_string(),
            rendezvous: None,
            validate_cred: None,
            server_handshake: None,
            debug_verbosity: None,
        }
    }
}

/// Work posted into the progress thread. Everything that touches server
/// state funnels through here; no core structure is reachable from any
/// other thread.
pub enum ServerOp {
    RegisterNspace {
        nspace: String,
        nlocal: usize,
        info: Vec<Info>,
        done: Sender<Status>,
    },
    DeregisterNspace {
        nspace: String,
        done: Sender<Status>,
    },
    RegisterClient {
        nspace: String,
        rank: i32,
        uid: u32,
        gid: u32,
        done: Sender<Status>,
    },
    NotifyError {
        status: Status,
        ranges: Vec<Range>,
        info: Vec<Info>,
    },
    ExecuteCollective {
        tracker: u64,
    },
    FenceComplete {
        tracker: u64,
        status: Status,
        data: Vec<ModexData>,
    },
    OpComplete {
        tracker: u64,
        status: Status,
    },
    SpawnComplete {
        peer: usize,
        tag: u32,
        status: Status,
        nspace: String,
    },
    GetComplete {
        peer: usize,
        tag: u32,
        status: Status,
        data: Vec<ModexData>,
    },
    TrackerComplete {
        tracker: u64,
    },
    Finalize {
        done: Sender<()>,
    },
}

/// Handle owned by the embedding host process. Dropping it (or calling
/// `finalize`) tears the progress thread down.
pub struct Server {
    waker: Waker<ServerOp>,
    thread: Option<thread::JoinHandle<()>>,
    uri: String,
    path: PathBuf,
    security_mode: String,
    debug_verbosity: Option<u32>,
    log: Logger,
}

impl Server {
    /// Binds the rendezvous socket and launches the progress thread.
    pub fn start(host: Box<dyn Host>, config: ServerConfig, log: Logger) -> PmixResult<Server> {
        let pid = std::process::id();
        let path = config
            .rendezvous
            .clone()
            .unwrap_or_else(|| usock::rendezvous_path(pid));
        // A stale socket from a dead server with our pid would block the
        // bind.
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|_| Status::Unreach)?;
        listener.set_nonblocking(true).map_err(|_| Status::Error)?;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o700));

        let uri = usock::server_uri(pid, &path);
        let (waker, queue) = wake_pair();
        let security_mode = config.security_mode.clone();
        let debug_verbosity = config.debug_verbosity;

        logging::info!(log, "server listening"; "uri" => &uri);

        let loop_log = log.new(logging::o!("thread" => "progress"));
        let loop_waker = waker.clone();
        let thread = thread::Builder::new()
            .name("pmix-progress".to_string())
            .spawn(move || {
                let mut server_loop =
                    match ServerLoop::new(listener, queue, loop_waker, host, config, loop_log) {
                        Ok(server_loop) => server_loop,
                        Err(_) => return,
                    };
                server_loop.run();
            })
            .map_err(|_| Status::OutOfResource)?;

        Ok(Server {
            waker,
            thread: Some(thread),
            uri,
            path,
            security_mode,
            debug_verbosity,
            log,
        })
    }

    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn rendezvous(&self) -> &std::path::Path {
        &self.path
    }

    fn roundtrip(&self, build: impl FnOnce(Sender<Status>) -> ServerOp) -> PmixResult<()> {
        let (tx, rx) = channel();
        self.waker.post(build(tx))?;
        rx.recv().map_err(|_| Status::Unreach)?.as_result()
    }

    /// Delivers job topology for a namespace ahead of its clients
    /// connecting.
    pub fn register_nspace(&self, nspace: &str, nlocal: usize, info: Vec<Info>) -> PmixResult<()> {
        let nspace = nspace.to_string();
        self.roundtrip(move |done| ServerOp::RegisterNspace {
            nspace,
            nlocal,
            info,
            done,
        })
    }

    pub fn deregister_nspace(&self, nspace: &str) -> PmixResult<()> {
        let nspace = nspace.to_string();
        self.roundtrip(move |done| ServerOp::DeregisterNspace { nspace, done })
    }

    /// Records one expected client rank.
    pub fn register_client(&self, nspace: &str, rank: i32, uid: u32, gid: u32) -> PmixResult<()> {
        let nspace = nspace.to_string();
        self.roundtrip(move |done| ServerOp::RegisterClient {
            nspace,
            rank,
            uid,
            gid,
            done,
        })
    }

    /// Environment contract for a forked client of the given rank.
    pub fn setup_fork(&self, nspace: &str, rank: i32) -> Vec<(String, String)> {
        let mut env = vec![
            ("PMIX_NAMESPACE".to_string(), nspace.to_string()),
            ("PMIX_RANK".to_string(), rank.to_string()),
            ("PMIX_SERVER_URI".to_string(), self.uri.clone()),
            ("PMIX_SECURITY_MODE".to_string(), self.security_mode.clone()),
        ];
        if let Some(verbosity) = self.debug_verbosity {
            env.push(("PMIX_DEBUG".to_string(), verbosity.to_string()));
        }
        env
    }

    /// Queues an error notification to every connected peer on tag zero.
    pub fn notify_error(
        &self,
        status: Status,
        ranges: Vec<Range>,
        info: Vec<Info>,
    ) -> PmixResult<()> {
        self.waker.post(ServerOp::NotifyError {
            status,
            ranges,
            info,
        })
    }

    /// Stops the progress thread, closes every peer and removes the
    /// rendezvous socket.
    pub fn finalize(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let (tx, rx) = channel();
            if self.waker.post(ServerOp::Finalize { done: tx }).is_ok() {
                let _ = rx.recv();
            }
            let _ = thread.join();
            logging::info!(self.log, "server finalized");
        }
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A get waiting for its target rank to commit.
struct PendingGet {
    peer: usize,
    tag: u32,
    nspace: String,
    rank: i32,
    key: Option<String>,
}

/// A lookup parked until every requested key is published or the deadline
/// passes.
struct PendingLookup {
    peer: usize,
    tag: u32,
    service: String,
    keys: Vec<String>,
    timer: Option<u64>,
}

struct ServerLoop {
    poll: Poll,
    listener: UnixListener,
    ops: WakeQueue<ServerOp>,
    waker: Waker<ServerOp>,
    peers: Vec<Option<Peer>>,
    free: Vec<usize>,
    registry: Registry,
    kvstore: KvStore,
    trackers: Trackers,
    directory: Directory,
    pending_gets: Vec<PendingGet>,
    pending_lookups: Vec<PendingLookup>,
    timers: Timers,
    host: Box<dyn Host>,
    config: ServerConfig,
    log: Logger,
}

impl ServerLoop {
    fn new(
        listener: UnixListener,
        ops: WakeQueue<ServerOp>,
        waker: Waker<ServerOp>,
        host: Box<dyn Host>,
        config: ServerConfig,
        log: Logger,
    ) -> PmixResult<ServerLoop> {
        let poll = Poll::new().map_err(|_| Status::Error)?;
        let fd = listener.as_raw_fd();
        poll.register(
            &EventedFd(&fd),
            LISTENER_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )
        .map_err(|_| Status::Error)?;
        ops.register(&poll, WAKER_TOKEN)?;

        let registry = Registry::new(log.new(logging::o!("component" => "registry")));

        Ok(ServerLoop {
            poll,
            listener,
            ops,
            waker,
            peers: Vec::new(),
            free: Vec::new(),
            registry,
            kvstore: KvStore::new(),
            trackers: Trackers::new(),
            directory: Directory::new(),
            pending_gets: Vec::new(),
            pending_lookups: Vec::new(),
            timers: Timers::new(),
            host,
            config,
            log,
        })
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = self.timers.next_timeout(Instant::now());
            if self.poll.poll(&mut events, timeout).is_err() {
                logging::error!(self.log, "poll failed, stopping progress thread");
                return;
            }

            let mut tokens: Vec<(Token, Ready)> = Vec::with_capacity(events.iter().count());
            for event in &events {
                tokens.push((event.token(), event.readiness()));
            }

            for (token, readiness) in tokens {
                match token {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {
                        if self.handle_ops() {
                            return;
                        }
                    }
                    token => self.peer_event(token, readiness),
                }
            }

            self.expire_timers(Instant::now());
        }
    }

    // -- accept / handshake ------------------------------------------------

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(status) = self.handshake(stream) {
                        logging::debug!(self.log, "handshake rejected"; "status" => %status);
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    /// Validates a new connection in blocking mode, then switches it to
    /// non-blocking and registers it with the event loop. Failures close
    /// the new socket without touching existing peers.
    fn handshake(&mut self, mut stream: UnixStream) -> PmixResult<()> {
        stream.set_nonblocking(false).map_err(|_| Status::Error)?;

        let hdr = usock::recv_header_blocking(&mut stream)?;
        if hdr.msg_type != MSG_TYPE_IDENT {
            return Err(Status::BadParam);
        }
        if hdr.nbytes > MAX_IDENT_PAYLOAD {
            self.refuse(&mut stream, Status::BadParam);
            return Err(Status::BadParam);
        }
        let mut payload = vec![0u8; hdr.nbytes as usize];
        usock::recv_blocking(&mut stream, &mut payload)?;

        let ident = match parse_ident(&payload) {
            Ok(ident) => ident,
            Err(status) => {
                self.refuse(&mut stream, status);
                return Err(status);
            }
        };

        // Only the major.minor components take part in the comparison.
        if !version_matches(&ident.version, VERSION) {
            logging::debug!(self.log, "version mismatch";
                            "client" => &ident.version, "server" => VERSION);
            self.refuse(&mut stream, Status::NotSupported);
            return Err(Status::NotSupported);
        }

        // A non-zero handshake tag marks a tool with no pre-registered
        // namespace; the host must resolve one before anything is sent.
        let (nspace, rank) = if hdr.tag != 0 {
            match self.host.allocate_tool_nspace() {
                None => {
                    self.refuse(&mut stream, Status::NotSupported);
                    return Err(Status::NotSupported);
                }
                Some(name) => {
                    self.registry.register_nspace(&name, 1, &[])?;
                    self.registry.register_client(&name, 0, 0, 0)?;
                    (name, 0)
                }
            }
        } else {
            (ident.nspace.clone(), ident.rank)
        };

        let ns_idx = match self.registry.find(&nspace) {
            Some(idx) => idx,
            None => {
                self.refuse(&mut stream, Status::NotFound);
                return Err(Status::NotFound);
            }
        };
        if self
            .registry
            .get(ns_idx)
            .and_then(|ns| ns.rank_info(rank))
            .is_none()
        {
            self.refuse(&mut stream, Status::NotFound);
            return Err(Status::NotFound);
        }

        if let Some(validate) = &self.config.validate_cred {
            let verdict = validate(&ident.cred);
            if !verdict.is_success() {
                self.refuse(&mut stream, verdict);
                return Err(verdict);
            }
        }

        if let Some(hook) = &self.config.server_handshake {
            send_status_reply(&mut stream, Status::ReadyForHandshake, None)?;
            let verdict = hook(&mut stream);
            if !verdict.is_success() {
                return Err(verdict);
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.peers.push(None);
                self.peers.len() - 1
            }
        };

        // Admission reply: success status, the peer's array index, then
        // the namespace's job-info blob.
        let mut reply = Buffer::fully_desc();
        codec::pack(&mut reply, &[Status::Success.as_i32()])?;
        codec::pack(&mut reply, &[index as u32])?;
        let job_info = &self
            .registry
            .get(ns_idx)
            .expect("Namespace index was just resolved")
            .job_info;
        reply.append_payload(job_info);

        if let Err(status) = send_status_payload(&mut stream, reply.into_vec()) {
            self.free.push(index);
            return Err(status);
        }

        stream.set_nonblocking(true).map_err(|_| Status::Error)?;

        let mut peer = Peer::new(index, stream, ns_idx, nspace.clone(), rank, &self.log);
        if peer.update_registration(&self.poll).is_err() {
            self.free.push(index);
            return Err(Status::Error);
        }
        if let Some(info) = self
            .registry
            .get_mut(ns_idx)
            .and_then(|ns| ns.rank_info_mut(rank))
        {
            info.proc_cnt += 1;
        }
        logging::info!(self.log, "client connected";
                       "nspace" => &nspace, "rank" => rank, "peer" => index);
        self.peers[index] = Some(peer);
        Ok(())
    }

    /// Best-effort status-only refusal before closing a handshake socket.
    fn refuse(&self, stream: &mut UnixStream, status: Status) {
        let _ = send_status_reply(stream, status, None);
    }

    // -- peer I/O ----------------------------------------------------------

    fn peer_event(&mut self, token: Token, readiness: Ready) {
        let index = token.0 - PEER_TOKEN_BASE;

        if readiness.is_readable() {
            loop {
                let pumped = match self.peers.get_mut(index).and_then(Option::as_mut) {
                    Some(peer) if peer.read_enabled => peer.pump_recv(),
                    _ => break,
                };
                match pumped {
                    Ok((hdr, payload)) => self.handle_message(index, hdr, payload),
                    Err(TxError::Wait) => break,
                    Err(_) => {
                        self.close_peer(index);
                        return;
                    }
                }
            }
        }

        if readiness.is_writable() {
            let pumped = match self.peers.get_mut(index).and_then(Option::as_mut) {
                Some(peer) => peer.pump_send(),
                None => return,
            };
            match pumped {
                Ok(()) => self.update_peer_registration(index),
                Err(TxError::Wait) => {}
                Err(_) => self.close_peer(index),
            }
        }
    }

    fn handle_message(&mut self, index: usize, hdr: Header, payload: Vec<u8>) {
        let mut buf = Buffer::from_vec(BufKind::FullyDesc, payload);
        if let Err(status) = self.dispatch(index, hdr.tag, &mut buf) {
            logging::debug!(self.log, "request failed";
                            "peer" => index, "tag" => hdr.tag, "status" => %status);
            self.post_status_reply(index, hdr.tag, status);
        }
    }

    fn update_peer_registration(&mut self, index: usize) {
        let poll = &self.poll;
        let failed = match self.peers.get_mut(index).and_then(Option::as_mut) {
            Some(peer) => peer.update_registration(poll).is_err(),
            None => false,
        };
        if failed {
            self.close_peer(index);
        }
    }

    /// Queues a framed reply and arms the peer's write side.
    fn post_reply(&mut self, index: usize, tag: u32, payload: Vec<u8>) {
        let failed = match self.peers.get_mut(index).and_then(Option::as_mut) {
            Some(peer) => peer.queue_reply(tag, payload).is_err(),
            None => return,
        };
        if failed {
            self.close_peer(index);
        } else {
            self.update_peer_registration(index);
        }
    }

    fn post_status_reply(&mut self, index: usize, tag: u32, status: Status) {
        let mut buf = Buffer::fully_desc();
        if codec::pack(&mut buf, &[status.as_i32()]).is_ok() {
            self.post_reply(index, tag, buf.into_vec());
        }
    }

    /// Tears a peer down: events deregistered, in-flight transfers freed,
    /// tracker expectations adjusted so surviving collectives still fire.
    fn close_peer(&mut self, index: usize) {
        let peer = match self.peers.get_mut(index).and_then(Option::take) {
            Some(peer) => peer,
            None => return,
        };
        if let Some(info) = self
            .registry
            .get_mut(peer.ns_idx)
            .and_then(|ns| ns.rank_info_mut(peer.rank))
        {
            info.proc_cnt = info.proc_cnt.saturating_sub(1);
        }
        peer.close(&self.poll);
        self.free.push(index);
        self.pending_gets.retain(|get| get.peer != index);
        self.pending_lookups.retain(|lookup| lookup.peer != index);
        self.trackers.drop_peer(index);
        self.refresh_trackers();
    }

    // -- posted ops --------------------------------------------------------

    /// Returns true when a finalize was processed and the loop must exit.
    fn handle_ops(&mut self) -> bool {
        for op in self.ops.drain() {
            match op {
                ServerOp::RegisterNspace {
                    nspace,
                    nlocal,
                    info,
                    done,
                } => {
                    let status = match self.registry.register_nspace(&nspace, nlocal, &info) {
                        Ok(_) => Status::Success,
                        Err(status) => status,
                    };
                    let _ = done.send(status);
                }
                ServerOp::DeregisterNspace { nspace, done } => {
                    let status = match self.registry.deregister_nspace(&nspace) {
                        Ok(()) => {
                            self.kvstore.remove_nspace(&nspace);
                            Status::Success
                        }
                        Err(status) => status,
                    };
                    let _ = done.send(status);
                }
                ServerOp::RegisterClient {
                    nspace,
                    rank,
                    uid,
                    gid,
                    done,
                } => {
                    let status = match self.registry.register_client(&nspace, rank, uid, gid) {
                        Ok((_, completed)) => {
                            if completed {
                                self.refresh_trackers();
                            }
                            Status::Success
                        }
                        Err(status) => status,
                    };
                    let _ = done.send(status);
                }
                ServerOp::NotifyError {
                    status,
                    ranges,
                    info,
                } => self.broadcast_error(status, ranges, info),
                ServerOp::ExecuteCollective { tracker } => self.execute_collective(tracker),
                ServerOp::FenceComplete {
                    tracker,
                    status,
                    data,
                } => self.complete_fence(tracker, status, data),
                ServerOp::OpComplete { tracker, status } => self.complete_op(tracker, status),
                ServerOp::SpawnComplete {
                    peer,
                    tag,
                    status,
                    nspace,
                } => self.complete_spawn(peer, tag, status, nspace),
                ServerOp::GetComplete {
                    peer,
                    tag,
                    status,
                    data,
                } => self.complete_get(peer, tag, status, data),
                ServerOp::TrackerComplete { tracker } => {
                    self.trackers.remove(tracker);
                }
                ServerOp::Finalize { done } => {
                    let indices: Vec<usize> = (0..self.peers.len()).collect();
                    for index in indices {
                        if let Some(peer) = self.peers.get_mut(index).and_then(Option::take) {
                            peer.close(&self.poll);
                        }
                    }
                    let _ = done.send(());
                    return true;
                }
            }
        }
        false
    }

    fn broadcast_error(&mut self, status: Status, ranges: Vec<Range>, info: Vec<Info>) {
        let mut buf = Buffer::fully_desc();
        let packed = codec::pack(&mut buf, &[status.as_i32()])
            .and_then(|_| codec::pack(&mut buf, &[crate::types::Size(ranges.len() as u64)]))
            .and_then(|_| codec::pack(&mut buf, &ranges))
            .and_then(|_| codec::pack(&mut buf, &[crate::types::Size(info.len() as u64)]))
            .and_then(|_| codec::pack(&mut buf, &info));
        if packed.is_err() {
            return;
        }
        let payload = buf.into_vec();
        let indices: Vec<usize> = self
            .peers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        for index in indices {
            self.post_reply(index, 0, payload.clone());
        }
    }

    // -- collectives -------------------------------------------------------

    /// Re-evaluates the readiness of every live tracker; registration and
    /// peer-death both change the expected-contributor picture.
    fn refresh_trackers(&mut self) {
        for id in self.trackers.ids() {
            self.update_tracker(id);
        }
    }

    /// Flips `def_complete` once every expected local contributor is on
    /// the locals list, then schedules execution into a fresh event rather
    /// than running the host collective in the caller's path.
    fn update_tracker(&mut self, id: u64) {
        let ready = match self.trackers.get(id) {
            Some(tracker) if !tracker.fired && !tracker.def_complete => {
                self.tracker_ready(tracker)
            }
            _ => return,
        };
        if !ready {
            return;
        }
        if let Some(tracker) = self.trackers.get_mut(id) {
            tracker.def_complete = true;
        }
        let _ = self.waker.post(ServerOp::ExecuteCollective { tracker: id });
    }

    fn tracker_ready(&self, tracker: &tracker::Tracker) -> bool {
        for nspace in tracker.nspaces() {
            let ns = match self.registry.find(&nspace).and_then(|idx| self.registry.get(idx)) {
                Some(ns) => ns,
                // Not registered yet; the collective waits.
                None => return false,
            };
            if !ns.all_registered {
                return false;
            }
            for rank in ns.local_ranks() {
                if tracker.includes(&nspace, rank)
                    && !tracker.is_removed(&nspace, rank)
                    && !tracker.has_local(&nspace, rank)
                {
                    return false;
                }
            }
        }
        true
    }

    fn execute_collective(&mut self, id: u64) {
        let (kind, ranges, collect, contributors) = match self.trackers.get_mut(id) {
            Some(tracker) if !tracker.fired => {
                tracker.fired = true;
                let mut contributors: Vec<(String, i32)> = Vec::new();
                for part in &tracker.locals {
                    let key = (part.nspace.clone(), part.rank);
                    if !contributors.contains(&key) {
                        contributors.push(key);
                    }
                }
                (
                    tracker.kind,
                    tracker.ranges.clone(),
                    tracker.collect_data,
                    contributors,
                )
            }
            _ => return,
        };

        let verdict = match kind {
            CollectiveKind::Fence => {
                let data = if collect {
                    let mut data = Vec::with_capacity(contributors.len());
                    for (nspace, rank) in &contributors {
                        let blob = match self.kvstore.blob_for(
                            nspace,
                            *rank,
                            &[Scope::Remote, Scope::Global],
                        ) {
                            Ok(blob) => blob,
                            Err(status) => {
                                self.fail_tracker(id, status);
                                return;
                            }
                        };
                        data.push(ModexData {
                            nspace: nspace.clone(),
                            rank: *rank,
                            blob,
                        });
                    }
                    data
                } else {
                    Vec::new()
                };
                let done = FenceDone {
                    waker: self.waker.clone(),
                    tracker: id,
                };
                self.host.fence_nb(&ranges, collect, data, done)
            }
            CollectiveKind::Connect => {
                let done = OpDone {
                    waker: self.waker.clone(),
                    tracker: id,
                };
                self.host.connect_nb(&ranges, done)
            }
            CollectiveKind::Disconnect => {
                let done = OpDone {
                    waker: self.waker.clone(),
                    tracker: id,
                };
                self.host.disconnect_nb(&ranges, done)
            }
        };

        if !verdict.is_success() {
            self.fail_tracker(id, verdict);
        }
    }

    /// A failed host collective propagates its status into every
    /// participant's reply.
    fn fail_tracker(&mut self, id: u64, status: Status) {
        let locals: Vec<LocalPart> = match self.trackers.remove(id) {
            Some(tracker) => tracker.locals,
            None => return,
        };
        for part in locals {
            self.post_status_reply(part.peer, part.tag, status);
        }
    }

    fn complete_fence(&mut self, id: u64, status: Status, data: Vec<ModexData>) {
        let locals: Vec<LocalPart> = match self.trackers.get(id) {
            Some(tracker) => tracker.locals.clone(),
            None => return,
        };

        let mut reply = Buffer::fully_desc();
        let packed = codec::pack(&mut reply, &[status.as_i32()])
            .and_then(|_| codec::pack(&mut reply, &[crate::types::Size(data.len() as u64)]))
            .and_then(|_| codec::pack(&mut reply, &data));
        if packed.is_err() {
            self.fail_tracker(id, Status::PackFailure);
            return;
        }
        let payload = reply.into_vec();

        // Every participant sees exactly one reply, in join order.
        for part in locals {
            self.post_reply(part.peer, part.tag, payload.clone());
        }
        let _ = self.waker.post(ServerOp::TrackerComplete { tracker: id });
    }

    fn complete_op(&mut self, id: u64, status: Status) {
        let (locals, nspaces) = match self.trackers.get(id) {
            Some(tracker) => {
                // Unique namespaces in the order their participants joined.
                let mut nspaces: Vec<String> = Vec::new();
                for part in &tracker.locals {
                    if !nspaces.contains(&part.nspace) {
                        nspaces.push(part.nspace.clone());
                    }
                }
                (tracker.locals.clone(), nspaces)
            }
            None => return,
        };

        let mut reply = Buffer::fully_desc();
        if codec::pack(&mut reply, &[status.as_i32()]).is_err() {
            self.fail_tracker(id, Status::PackFailure);
            return;
        }
        if status.is_success() {
            for nspace in &nspaces {
                let job_info = self
                    .registry
                    .find(nspace)
                    .and_then(|idx| self.registry.get(idx))
                    .map(|ns| ns.job_info.clone());
                if let Some(job_info) = job_info {
                    if codec::pack(&mut reply, &[job_info]).is_err() {
                        self.fail_tracker(id, Status::PackFailure);
                        return;
                    }
                }
            }
        }
        let payload = reply.into_vec();

        for part in locals {
            self.post_reply(part.peer, part.tag, payload.clone());
        }
        let _ = self.waker.post(ServerOp::TrackerComplete { tracker: id });
    }

    fn complete_spawn(&mut self, peer: usize, tag: u32, status: Status, nspace: String) {
        let mut reply = Buffer::fully_desc();
        let packed = codec::pack(&mut reply, &[status.as_i32()]).and_then(|_| {
            codec::pack(
                &mut reply,
                &[if status.is_success() {
                    Some(nspace)
                } else {
                    None
                }],
            )
        });
        if packed.is_ok() {
            self.post_reply(peer, tag, reply.into_vec());
        }
    }

    fn complete_get(&mut self, peer: usize, tag: u32, status: Status, data: Vec<ModexData>) {
        let mut reply = Buffer::fully_desc();
        let packed = codec::pack(&mut reply, &[status.as_i32()])
            .and_then(|_| codec::pack(&mut reply, &[crate::types::Size(data.len() as u64)]))
            .and_then(|_| codec::pack(&mut reply, &data));
        if packed.is_ok() {
            self.post_reply(peer, tag, reply.into_vec());
        }
    }

    // -- pending gets / lookups -------------------------------------------

    /// A commit for (nspace, rank) wakes every parked get that was waiting
    /// on it.
    fn wake_pending_gets(&mut self, nspace: &str, rank: i32) {
        let woken: Vec<PendingGet> = {
            let mut woken = Vec::new();
            let mut kept = Vec::new();
            for get in self.pending_gets.drain(..) {
                if get.nspace == nspace && get.rank == rank {
                    woken.push(get);
                } else {
                    kept.push(get);
                }
            }
            self.pending_gets = kept;
            woken
        };
        for get in woken {
            self.reply_local_get(get.peer, get.tag, &get.nspace, get.rank, get.key.as_deref());
        }
    }

    /// Serves a get from the local store. The rank must have committed.
    fn reply_local_get(
        &mut self,
        peer: usize,
        tag: u32,
        nspace: &str,
        rank: i32,
        key: Option<&str>,
    ) {
        if let Some(key) = key {
            if self.kvstore.get(nspace, rank, key).is_err() {
                self.post_status_reply(peer, tag, Status::NotFound);
                return;
            }
        } else if self.kvstore.get_all(nspace, rank).is_err() {
            self.post_status_reply(peer, tag, Status::NotFound);
            return;
        }
        let blob = match self.kvstore.blob_for(
            nspace,
            rank,
            &[Scope::Local, Scope::Remote, Scope::Global],
        ) {
            Ok(blob) => blob,
            Err(status) => {
                self.post_status_reply(peer, tag, status);
                return;
            }
        };
        let data = vec![ModexData {
            nspace: nspace.to_string(),
            rank,
            blob,
        }];
        self.complete_get(peer, tag, Status::Success, data);
    }

    /// A publish may satisfy parked lookups; a deadline expiry fails them.
    fn scan_pending_lookups(&mut self) {
        let ready: Vec<usize> = self
            .pending_lookups
            .iter()
            .enumerate()
            .filter(|(_, lookup)| self.directory.all_present(&lookup.service, &lookup.keys))
            .map(|(idx, _)| idx)
            .collect();
        // Remove back-to-front so indices stay valid.
        for idx in ready.into_iter().rev() {
            let lookup = self.pending_lookups.remove(idx);
            if let Some(timer) = lookup.timer {
                self.timers.cancel(timer);
            }
            self.reply_lookup(lookup.peer, lookup.tag, &lookup.service, &lookup.keys);
        }
    }

    fn reply_lookup(&mut self, peer: usize, tag: u32, service: &str, keys: &[String]) {
        match self.directory.lookup(service, keys) {
            Err(status) => self.post_status_reply(peer, tag, status),
            Ok((owner, infos)) => {
                let mut reply = Buffer::fully_desc();
                let packed = codec::pack(&mut reply, &[Status::Success.as_i32()])
                    .and_then(|_| codec::pack(&mut reply, &[Some(owner)]))
                    .and_then(|_| {
                        codec::pack(&mut reply, &[crate::types::Size(infos.len() as u64)])
                    })
                    .and_then(|_| codec::pack(&mut reply, &infos));
                match packed {
                    Ok(()) => self.post_reply(peer, tag, reply.into_vec()),
                    Err(status) => self.post_status_reply(peer, tag, status),
                }
            }
        }
    }

    fn expire_timers(&mut self, now: Instant) {
        for timer in self.timers.expired(now) {
            if let Some(pos) = self
                .pending_lookups
                .iter()
                .position(|lookup| lookup.timer == Some(timer))
            {
                let lookup = self.pending_lookups.remove(pos);
                logging::debug!(self.log, "lookup timed out";
                                "peer" => lookup.peer, "service" => &lookup.service);
                self.post_status_reply(lookup.peer, lookup.tag, Status::NotFound);
            }
        }
    }
}

// -- handshake helpers -----------------------------------------------------

struct Ident {
    nspace: String,
    rank: i32,
    version: String,
    cred: Vec<u8>,
}

/// Handshake payload layout: namespace NUL, rank (int32, wire order), NUL,
/// version NUL, then any remaining bytes as the opaque credential.
fn parse_ident(payload: &[u8]) -> PmixResult<Ident> {
    let ns_end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(Status::BadParam)?;
    let nspace = String::from_utf8(payload[..ns_end].to_vec()).map_err(|_| Status::BadParam)?;
    if nspace.len() > crate::types::MAX_NSLEN {
        return Err(Status::BadParam);
    }

    let rank_start = ns_end + 1;
    if payload.len() < rank_start + 5 {
        return Err(Status::BadParam);
    }
    let rank = i32::from_be_bytes([
        payload[rank_start],
        payload[rank_start + 1],
        payload[rank_start + 2],
        payload[rank_start + 3],
    ]);
    if payload[rank_start + 4] != 0 {
        return Err(Status::BadParam);
    }

    let ver_start = rank_start + 5;
    let ver_end = ver_start
        + payload[ver_start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Status::BadParam)?;
    let version =
        String::from_utf8(payload[ver_start..ver_end].to_vec()).map_err(|_| Status::BadParam)?;

    Ok(Ident {
        nspace,
        rank,
        version,
        cred: payload[ver_end + 1..].to_vec(),
    })
}

/// Builds the handshake identification payload.
pub(crate) fn build_ident(nspace: &str, rank: i32, version: &str, cred: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(nspace.len() + version.len() + cred.len() + 7);
    payload.extend_from_slice(nspace.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&rank.to_be_bytes());
    payload.push(0);
    payload.extend_from_slice(version.as_bytes());
    payload.push(0);
    payload.extend_from_slice(cred);
    payload
}

fn send_status_payload(stream: &mut UnixStream, payload: Vec<u8>) -> PmixResult<()> {
    let hdr = Header::new(0, MSG_TYPE_IDENT, 0, payload.len() as u64);
    usock::send_msg_blocking(stream, hdr, &payload)
}

fn send_status_reply(
    stream: &mut UnixStream,
    status: Status,
    extra: Option<&Buffer>,
) -> PmixResult<()> {
    let mut buf = Buffer::fully_desc();
    codec::pack(&mut buf, &[status.as_i32()])?;
    if let Some(extra) = extra {
        buf.append_payload(extra);
    }
    send_status_payload(stream, buf.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_roundtrip() {
        let payload = build_ident("job-0", 7, "1.0.0", b"secret");
        let ident = parse_ident(&payload).unwrap();
        assert_eq!(ident.nspace, "job-0");
        assert_eq!(ident.rank, 7);
        assert_eq!(ident.version, "1.0.0");
        assert_eq!(ident.cred, b"secret");
    }

    #[test]
    fn test_ident_without_credential() {
        let payload = build_ident("job", -1, "1.0.0", b"");
        let ident = parse_ident(&payload).unwrap();
        assert_eq!(ident.rank, -1);
        assert!(ident.cred.is_empty());
    }

    #[test]
    fn test_ident_rejects_truncation() {
        // Without a credential, every truncation cuts a mandatory field.
        let payload = build_ident("job", 0, "1.0.0", b"");
        for cut in 0..payload.len() {
            assert!(
                parse_ident(&payload[..cut]).is_err(),
                "cut at {} unexpectedly parsed",
                cut
            );
        }
    }

    #[test]
    fn test_header_size_matches_wire_math() {
        assert_eq!(crate::usock::HEADER_SIZE, 8 + 1 + 4 + 8);
    }
}
