//! Client side of the exchange engine: blocking handshake, a progress
//! thread demultiplexing tagged replies into completion channels, scope
//! staging for puts, and the full verb set over the command frame.

pub mod cache;

use std::collections::VecDeque;
use std::env;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::client::cache::Cache;
use crate::codec::{self, BufKind, Buffer};
use crate::event::{wake_pair, WakeQueue, Waker};
use crate::logging::{self, Logger};
use crate::server::build_ident;
use crate::status::{PmixResult, Status};
use crate::types::{
    App, Cmd, Info, Int, Kval, ModexData, Persistence, Range, Scope, Size, Value,
};
use crate::usock::{
    self, Header, RecvMsg, SendMsg, TxError, MSG_TYPE_IDENT, MSG_TYPE_USER,
};
use crate::VERSION;

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

pub type ErrHandler = Box<dyn Fn(Status, Vec<Range>, Vec<Info>) + Send>;
pub type ClientHandshakeHook = Box<dyn Fn(&mut UnixStream) -> Status + Send>;

pub struct ClientConfig {
    /// Opaque credential appended to the identification payload.
    pub cred: Vec<u8>,
    /// Responder for a server that answers `ReadyForHandshake`.
    pub client_handshake: Option<ClientHandshakeHook>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            cred: Vec::new(),
            client_handshake: None,
        }
    }
}

enum ClientOp {
    Request {
        payload: Vec<u8>,
        reply: Option<Sender<PmixResult<Vec<u8>>>>,
    },
    Shutdown,
}

/// One live connection to the local server.
pub struct Client {
    nspace: String,
    rank: i32,
    peer_index: u32,
    waker: Waker<ClientOp>,
    thread: Option<thread::JoinHandle<()>>,
    cache: Arc<Mutex<Cache>>,
    staging: Mutex<Staging>,
    errhandler: Arc<Mutex<Option<ErrHandler>>>,
    log: Logger,
}

/// Per-scope outbound staging; puts accumulate here until a commit drains
/// them onto the wire.
struct Staging {
    local: Buffer,
    remote: Buffer,
    global: Buffer,
}

impl Staging {
    fn new() -> Staging {
        Staging {
            local: Buffer::fully_desc(),
            remote: Buffer::fully_desc(),
            global: Buffer::fully_desc(),
        }
    }

    fn buffer(&mut self, scope: Scope) -> PmixResult<&mut Buffer> {
        match scope {
            Scope::Local => Ok(&mut self.local),
            Scope::Remote => Ok(&mut self.remote),
            Scope::Global => Ok(&mut self.global),
            Scope::Undef => Err(Status::BadParam),
        }
    }

    fn drain(&mut self) -> Vec<(Scope, Buffer)> {
        let mut out = Vec::new();
        for &scope in &[Scope::Local, Scope::Remote, Scope::Global] {
            let buf = self.buffer(scope).expect("Staging scopes are fixed");
            if buf.used() > 0 {
                out.push((scope, std::mem::replace(buf, Buffer::fully_desc())));
            }
        }
        out
    }
}

impl Client {
    /// Bootstraps from the environment a server's `setup_fork` provides.
    pub fn init(log: Logger) -> PmixResult<Client> {
        let nspace = env::var("PMIX_NAMESPACE").map_err(|_| Status::NotInitialized)?;
        let rank = env::var("PMIX_RANK")
            .map_err(|_| Status::NotInitialized)?
            .parse::<i32>()
            .map_err(|_| Status::BadParam)?;
        let uri = env::var("PMIX_SERVER_URI").map_err(|_| Status::NotInitialized)?;
        let (_pid, path) = usock::parse_uri(&uri)?;
        Client::connect(&path, &nspace, rank, ClientConfig::default(), log)
    }

    /// Connects to the rendezvous socket and completes the handshake in
    /// blocking mode, then hands the socket to the progress thread.
    pub fn connect(
        path: &Path,
        nspace: &str,
        rank: i32,
        config: ClientConfig,
        log: Logger,
    ) -> PmixResult<Client> {
        let mut stream = UnixStream::connect(path).map_err(|_| Status::Unreach)?;

        let ident = build_ident(nspace, rank, VERSION, &config.cred);
        let hdr = Header::new(
            u64::from(std::process::id()),
            MSG_TYPE_IDENT,
            0,
            ident.len() as u64,
        );
        usock::send_msg_blocking(&mut stream, hdr, &ident)?;

        let mut reply = recv_reply_blocking(&mut stream)?;
        let mut status = Status::from_i32(codec::unpack_one::<i32>(&mut reply)?);
        if status == Status::ReadyForHandshake {
            let hook = config.client_handshake.as_ref().ok_or(Status::NotSupported)?;
            hook(&mut stream).as_result()?;
            reply = recv_reply_blocking(&mut stream)?;
            status = Status::from_i32(codec::unpack_one::<i32>(&mut reply)?);
        }
        status.as_result()?;

        let peer_index: u32 = codec::unpack_one(&mut reply)?;
        let mut cache = Cache::new();
        cache.absorb_job_info(&mut reply)?;

        stream.set_nonblocking(true).map_err(|_| Status::Error)?;

        logging::info!(log, "connected to server";
                       "nspace" => nspace, "rank" => rank, "index" => peer_index);

        let cache = Arc::new(Mutex::new(cache));
        let errhandler: Arc<Mutex<Option<ErrHandler>>> = Arc::new(Mutex::new(None));
        let (waker, queue) = wake_pair();

        let loop_cache = cache.clone();
        let loop_errhandler = errhandler.clone();
        let loop_log = log.new(logging::o!("thread" => "progress"));
        let loop_index = peer_index;
        let thread = thread::Builder::new()
            .name("pmix-client".to_string())
            .spawn(move || {
                let mut client_loop = match ClientLoop::new(
                    stream,
                    queue,
                    loop_index,
                    loop_cache,
                    loop_errhandler,
                    loop_log,
                ) {
                    Ok(client_loop) => client_loop,
                    Err(_) => return,
                };
                client_loop.run();
            })
            .map_err(|_| Status::OutOfResource)?;

        Ok(Client {
            nspace: nspace.to_string(),
            rank,
            peer_index,
            waker,
            thread: Some(thread),
            cache,
            staging: Mutex::new(Staging::new()),
            errhandler,
            log,
        })
    }

    #[inline]
    pub fn nspace(&self) -> &str {
        &self.nspace
    }

    #[inline]
    pub fn rank(&self) -> i32 {
        self.rank
    }

    #[inline]
    pub fn peer_index(&self) -> u32 {
        self.peer_index
    }

    pub fn set_errhandler(&self, handler: ErrHandler) {
        *self.errhandler.lock().expect("Errhandler lock poisoned") = Some(handler);
    }

    pub fn clear_errhandler(&self) {
        *self.errhandler.lock().expect("Errhandler lock poisoned") = None;
    }

    // -- staging -----------------------------------------------------------

    /// Stages one entry in the scope's outbound buffer and mirrors it for
    /// self-reads.
    pub fn put(&self, scope: Scope, key: &str, value: Value) -> PmixResult<()> {
        if key.is_empty() || key.len() > crate::types::MAX_KEYLEN {
            return Err(Status::BadParam);
        }
        {
            let mut staging = self.staging.lock().expect("Staging lock poisoned");
            let buf = staging.buffer(scope)?;
            codec::pack(buf, &[Kval::new(key, value.clone())])?;
        }
        self.cache
            .lock()
            .expect("Cache lock poisoned")
            .put(&self.nspace, self.rank, key.to_string(), value);
        Ok(())
    }

    /// Transmits the staged buffers. Fire-and-forget: ordering against a
    /// following fence is the stream order.
    pub fn commit(&self) -> PmixResult<()> {
        let staged = self
            .staging
            .lock()
            .expect("Staging lock poisoned")
            .drain();
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::Commit)])?;
        for (scope, buf) in staged {
            codec::pack(&mut payload, &[scope as u8])?;
            codec::pack(&mut payload, &[buf])?;
        }
        self.request(payload.into_vec(), None)
    }

    // -- collectives -------------------------------------------------------

    pub fn fence_nb(&self, ranges: &[Range], collect_data: bool) -> PmixResult<PendingFence> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::FenceNb)])?;
        codec::pack(&mut payload, &[Size(ranges.len() as u64)])?;
        codec::pack(&mut payload, ranges)?;
        codec::pack(&mut payload, &[collect_data])?;

        let (tx, rx) = channel();
        self.request(payload.into_vec(), Some(tx))?;
        Ok(PendingFence {
            rx,
            cache: self.cache.clone(),
        })
    }

    /// Barriers the participants, blocking until every one has arrived.
    pub fn fence(&self, ranges: &[Range], collect_data: bool) -> PmixResult<()> {
        self.fence_nb(ranges, collect_data)?.wait()
    }

    pub fn connect_procs(&self, ranges: &[Range]) -> PmixResult<()> {
        self.connect_op(Cmd::ConnectNb, ranges)
    }

    pub fn disconnect_procs(&self, ranges: &[Range]) -> PmixResult<()> {
        self.connect_op(Cmd::DisconnectNb, ranges)
    }

    fn connect_op(&self, cmd: Cmd, ranges: &[Range]) -> PmixResult<()> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(cmd)])?;
        codec::pack(&mut payload, &[Size(ranges.len() as u64)])?;
        codec::pack(&mut payload, ranges)?;

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()?;
        // The reply carries every participating namespace's job-info.
        let mut cache = self.cache.lock().expect("Cache lock poisoned");
        while !reply.is_exhausted() {
            let mut job_info: Buffer = codec::unpack_one(&mut reply)?;
            cache.absorb_job_info(&mut job_info)?;
        }
        Ok(())
    }

    // -- data retrieval ----------------------------------------------------

    pub fn get_nb(&self, nspace: &str, rank: i32, key: &str) -> PmixResult<PendingGet> {
        if let Some(value) = self
            .cache
            .lock()
            .expect("Cache lock poisoned")
            .get(nspace, rank, key)
        {
            return Ok(PendingGet {
                ready: Some(value),
                rx: None,
                cache: self.cache.clone(),
                nspace: nspace.to_string(),
                rank,
                key: key.to_string(),
            });
        }

        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::GetNb)])?;
        codec::pack(&mut payload, &[Some(nspace.to_string())])?;
        codec::pack(&mut payload, &[Int(rank)])?;
        codec::pack(&mut payload, &[Some(key.to_string())])?;

        let (tx, rx) = channel();
        self.request(payload.into_vec(), Some(tx))?;
        Ok(PendingGet {
            ready: None,
            rx: Some(rx),
            cache: self.cache.clone(),
            nspace: nspace.to_string(),
            rank,
            key: key.to_string(),
        })
    }

    /// Retrieves a committed entry, blocking until its owner has committed
    /// it (a fence the owner participated in guarantees availability).
    pub fn get(&self, nspace: &str, rank: i32, key: &str) -> PmixResult<Value> {
        self.get_nb(nspace, rank, key)?.wait()
    }

    // -- service directory -------------------------------------------------

    pub fn publish(
        &self,
        service: &str,
        persistence: Persistence,
        infos: &[Info],
    ) -> PmixResult<()> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::PublishNb)])?;
        codec::pack(&mut payload, &[Some(service.to_string())])?;
        codec::pack(&mut payload, &[persistence as u8])?;
        codec::pack(&mut payload, &[Size(infos.len() as u64)])?;
        codec::pack(&mut payload, infos)?;

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()
    }

    /// Resolves keys from the directory. With `wait` the server parks the
    /// request until everything is published or the timeout passes.
    pub fn lookup(
        &self,
        service: &str,
        keys: &[&str],
        wait: bool,
        timeout: Option<Duration>,
    ) -> PmixResult<(String, Vec<Info>)> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::LookupNb)])?;
        codec::pack(&mut payload, &[Some(service.to_string())])?;
        codec::pack(&mut payload, &[Size(keys.len() as u64)])?;
        let keys: Vec<Option<String>> = keys.iter().map(|k| Some(k.to_string())).collect();
        codec::pack(&mut payload, &keys)?;
        codec::pack(&mut payload, &[wait])?;
        codec::pack(
            &mut payload,
            &[timeout.map_or(0i64, |t| t.as_millis() as i64)],
        )?;

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()?;
        let owner: Option<String> = codec::unpack_one(&mut reply)?;
        let ninfo: Size = codec::unpack_one(&mut reply)?;
        let mut infos = Vec::new();
        codec::unpack(&mut reply, &mut infos, ninfo.0 as i32)?;
        Ok((owner.unwrap_or_default(), infos))
    }

    pub fn unpublish(
        &self,
        service: &str,
        keys: &[&str],
        persistence: Option<Persistence>,
    ) -> PmixResult<()> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::UnpublishNb)])?;
        codec::pack(&mut payload, &[Some(service.to_string())])?;
        codec::pack(&mut payload, &[Size(keys.len() as u64)])?;
        let keys: Vec<Option<String>> = keys.iter().map(|k| Some(k.to_string())).collect();
        codec::pack(&mut payload, &keys)?;
        codec::pack(&mut payload, &[persistence.is_some()])?;
        if let Some(persistence) = persistence {
            codec::pack(&mut payload, &[persistence as u8])?;
        }

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()
    }

    // -- process management ------------------------------------------------

    /// Asks the host to launch the applications; resolves to the new
    /// namespace.
    pub fn spawn(&self, apps: &[App]) -> PmixResult<String> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::SpawnNb)])?;
        codec::pack(&mut payload, &[Size(apps.len() as u64)])?;
        codec::pack(&mut payload, apps)?;

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()?;
        let nspace: Option<String> = codec::unpack_one(&mut reply)?;
        nspace.ok_or(Status::UnpackFailure)
    }

    pub fn abort(&self, status: Status, msg: &str) -> PmixResult<()> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::Abort)])?;
        codec::pack(&mut payload, &[status.as_i32()])?;
        codec::pack(&mut payload, &[Some(msg.to_string())])?;

        let mut reply = self.roundtrip(payload.into_vec())?;
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()
    }

    /// Orderly teardown: tells the server, waits for the acknowledgement,
    /// then stops the progress thread.
    pub fn finalize(mut self) -> PmixResult<()> {
        let mut payload = Buffer::fully_desc();
        codec::pack(&mut payload, &[u32::from(Cmd::Finalize)])?;
        let verdict = self
            .roundtrip(payload.into_vec())
            .and_then(|mut reply| {
                Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()
            });
        self.stop_thread();
        verdict
    }

    // -- plumbing ----------------------------------------------------------

    fn request(
        &self,
        payload: Vec<u8>,
        reply: Option<Sender<PmixResult<Vec<u8>>>>,
    ) -> PmixResult<()> {
        self.waker.post(ClientOp::Request { payload, reply })
    }

    fn roundtrip(&self, payload: Vec<u8>) -> PmixResult<Buffer> {
        let (tx, rx) = channel();
        self.request(payload, Some(tx))?;
        let raw = rx.recv().map_err(|_| Status::Unreach)??;
        Ok(Buffer::from_vec(BufKind::FullyDesc, raw))
    }

    fn stop_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.waker.post(ClientOp::Shutdown);
            let _ = thread.join();
            logging::debug!(self.log, "client progress thread stopped");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Outstanding fence; `wait` blocks for the reply and folds the collected
/// blobs into the cache.
pub struct PendingFence {
    rx: Receiver<PmixResult<Vec<u8>>>,
    cache: Arc<Mutex<Cache>>,
}

impl PendingFence {
    pub fn wait(self) -> PmixResult<()> {
        let raw = self.rx.recv().map_err(|_| Status::Unreach)??;
        let mut reply = Buffer::from_vec(BufKind::FullyDesc, raw);
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()?;
        let ndata: Size = codec::unpack_one(&mut reply)?;
        let mut data: Vec<ModexData> = Vec::new();
        codec::unpack(&mut reply, &mut data, ndata.0 as i32)?;
        let mut cache = self.cache.lock().expect("Cache lock poisoned");
        for modex in &data {
            cache.absorb_modex(modex)?;
        }
        Ok(())
    }
}

/// Outstanding get. Resolves from the cache when the data was already
/// local, otherwise waits for the server's reply.
pub struct PendingGet {
    ready: Option<Value>,
    rx: Option<Receiver<PmixResult<Vec<u8>>>>,
    cache: Arc<Mutex<Cache>>,
    nspace: String,
    rank: i32,
    key: String,
}

impl PendingGet {
    pub fn wait(self) -> PmixResult<Value> {
        if let Some(value) = self.ready {
            return Ok(value);
        }
        let rx = self.rx.ok_or(Status::Error)?;
        let raw = rx.recv().map_err(|_| Status::Unreach)??;
        let mut reply = Buffer::from_vec(BufKind::FullyDesc, raw);
        Status::from_i32(codec::unpack_one::<i32>(&mut reply)?).as_result()?;
        let ndata: Size = codec::unpack_one(&mut reply)?;
        let mut data: Vec<ModexData> = Vec::new();
        codec::unpack(&mut reply, &mut data, ndata.0 as i32)?;

        let mut cache = self.cache.lock().expect("Cache lock poisoned");
        for modex in &data {
            cache.absorb_modex(modex)?;
        }
        cache
            .get(&self.nspace, self.rank, &self.key)
            .ok_or(Status::NotFound)
    }
}

fn recv_reply_blocking(stream: &mut UnixStream) -> PmixResult<Buffer> {
    let hdr = usock::recv_header_blocking(stream)?;
    let mut payload = vec![0u8; hdr.nbytes as usize];
    usock::recv_blocking(stream, &mut payload)?;
    Ok(Buffer::from_vec(BufKind::FullyDesc, payload))
}

// -- progress loop ---------------------------------------------------------

struct ClientLoop {
    poll: Poll,
    stream: UnixStream,
    ops: WakeQueue<ClientOp>,
    peer_index: u64,
    send_queue: VecDeque<SendMsg>,
    in_send: Option<SendMsg>,
    in_recv: RecvMsg,
    pending: HashMap<u32, Sender<PmixResult<Vec<u8>>>>,
    next_tag: u32,
    cache: Arc<Mutex<Cache>>,
    errhandler: Arc<Mutex<Option<ErrHandler>>>,
    registered: bool,
    dead: bool,
    log: Logger,
}

impl ClientLoop {
    fn new(
        stream: UnixStream,
        ops: WakeQueue<ClientOp>,
        peer_index: u32,
        cache: Arc<Mutex<Cache>>,
        errhandler: Arc<Mutex<Option<ErrHandler>>>,
        log: Logger,
    ) -> PmixResult<ClientLoop> {
        let poll = Poll::new().map_err(|_| Status::Error)?;
        ops.register(&poll, WAKER_TOKEN)?;
        let mut client_loop = ClientLoop {
            poll,
            stream,
            ops,
            peer_index: u64::from(peer_index),
            send_queue: VecDeque::new(),
            in_send: None,
            in_recv: RecvMsg::new(),
            pending: HashMap::new(),
            next_tag: 1,
            cache,
            errhandler,
            registered: false,
            dead: false,
            log,
        };
        client_loop.update_registration()?;
        Ok(client_loop)
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if self.poll.poll(&mut events, None).is_err() {
                return;
            }
            let mut saw_stream = Ready::empty();
            let mut saw_waker = false;
            for event in &events {
                match event.token() {
                    STREAM_TOKEN => saw_stream = saw_stream | event.readiness(),
                    WAKER_TOKEN => saw_waker = true,
                    _ => {}
                }
            }
            if saw_stream.is_readable() {
                self.pump_recv();
            }
            if saw_stream.is_writable() {
                self.pump_send();
            }
            if saw_waker && self.handle_ops() {
                return;
            }
        }
    }

    fn interest(&self) -> Ready {
        let mut ready = Ready::readable();
        if self.in_send.is_some() || !self.send_queue.is_empty() {
            ready = ready | Ready::writable();
        }
        ready
    }

    fn update_registration(&mut self) -> PmixResult<()> {
        if self.dead {
            return Ok(());
        }
        let fd = self.stream.as_raw_fd();
        let result = if self.registered {
            self.poll
                .reregister(&EventedFd(&fd), STREAM_TOKEN, self.interest(), PollOpt::level())
        } else {
            self.poll
                .register(&EventedFd(&fd), STREAM_TOKEN, self.interest(), PollOpt::level())
        };
        self.registered = true;
        result.map_err(|_| Status::Error)
    }

    /// Returns true when a shutdown op was seen.
    fn handle_ops(&mut self) -> bool {
        for op in self.ops.drain() {
            match op {
                ClientOp::Request { payload, reply } => {
                    if self.dead {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(Status::Unreach));
                        }
                        continue;
                    }
                    let tag = self.alloc_tag();
                    if let Some(reply) = reply {
                        self.pending.insert(tag, reply);
                    }
                    let hdr = Header::new(
                        self.peer_index,
                        MSG_TYPE_USER,
                        tag,
                        payload.len() as u64,
                    );
                    self.send_queue.push_back(SendMsg::new(hdr, payload));
                    let _ = self.update_registration();
                    // Kick the transfer in case the socket is writable now.
                    self.pump_send();
                }
                ClientOp::Shutdown => {
                    self.fail_pending(Status::Unreach);
                    return true;
                }
            }
        }
        false
    }

    /// Tags demultiplex concurrent requests; zero is reserved for
    /// server-initiated notifications.
    fn alloc_tag(&mut self) -> u32 {
        loop {
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            if tag != 0 && !self.pending.contains_key(&tag) {
                return tag;
            }
        }
    }

    fn pump_send(&mut self) {
        if self.dead {
            return;
        }
        loop {
            let mut msg = match self.in_send.take() {
                Some(msg) => msg,
                None => match self.send_queue.pop_front() {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg.advance(&mut self.stream) {
                Ok(()) => continue,
                Err(TxError::Wait) => {
                    self.in_send = Some(msg);
                    break;
                }
                Err(_) => {
                    self.mark_dead();
                    return;
                }
            }
        }
        let _ = self.update_registration();
    }

    fn pump_recv(&mut self) {
        if self.dead {
            return;
        }
        loop {
            match self.in_recv.advance(&mut self.stream) {
                Ok((hdr, payload)) => self.deliver(hdr, payload),
                Err(TxError::Wait) => return,
                Err(_) => {
                    self.mark_dead();
                    return;
                }
            }
        }
    }

    fn deliver(&mut self, hdr: Header, payload: Vec<u8>) {
        if hdr.tag == 0 {
            self.handle_notification(payload);
            return;
        }
        match self.pending.remove(&hdr.tag) {
            Some(reply) => {
                let _ = reply.send(Ok(payload));
            }
            None => {
                logging::warn!(self.log, "reply with no outstanding request";
                               "tag" => hdr.tag);
            }
        }
    }

    /// Tag-zero traffic is a server error notification.
    fn handle_notification(&mut self, payload: Vec<u8>) {
        let parsed = (|| -> PmixResult<(Status, Vec<Range>, Vec<Info>)> {
            let mut buf = Buffer::from_vec(BufKind::FullyDesc, payload);
            let status = Status::from_i32(codec::unpack_one::<i32>(&mut buf)?);
            let nranges: Size = codec::unpack_one(&mut buf)?;
            let mut ranges = Vec::new();
            codec::unpack(&mut buf, &mut ranges, nranges.0 as i32)?;
            let ninfo: Size = codec::unpack_one(&mut buf)?;
            let mut info = Vec::new();
            codec::unpack(&mut buf, &mut info, ninfo.0 as i32)?;
            Ok((status, ranges, info))
        })();
        match parsed {
            Ok((status, ranges, info)) => {
                logging::debug!(self.log, "error notification"; "status" => %status);
                if let Some(handler) = &*self
                    .errhandler
                    .lock()
                    .expect("Errhandler lock poisoned")
                {
                    handler(status, ranges, info);
                }
            }
            Err(status) => {
                logging::warn!(self.log, "malformed notification"; "status" => %status);
            }
        }
    }

    /// A transport failure aborts every operation attached to this
    /// connection; the server continues without us.
    fn mark_dead(&mut self) {
        if self.dead {
            return;
        }
        logging::warn!(self.log, "connection to server lost");
        if self.registered {
            let fd = self.stream.as_raw_fd();
            let _ = self.poll.deregister(&EventedFd(&fd));
            self.registered = false;
        }
        self.dead = true;
        self.send_queue.clear();
        self.in_send = None;
        self.fail_pending(Status::Unreach);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn fail_pending(&mut self, status: Status) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(status));
        }
    }
}
