//! End-to-end exchange scenarios against an in-process self-hosted
//! server: data-collecting fences, publish/lookup, cross-namespace
//! connects, parked gets and mid-collective disconnects.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use pmix::client::{Client, ClientConfig};
use pmix::codec::{self, Buffer};
use pmix::server::{FenceDone, Host, OpDone, SelfHost, Server, ServerConfig, SpawnDone};
use pmix::types::{App, Info, ModexData, Range, RANK_WILDCARD};
use pmix::usock::{Header, HEADER_SIZE, MSG_TYPE_IDENT};
use pmix::{Persistence, Scope, Status, Value};

fn log() -> pmix::logging::Logger {
    pmix::logging::discard()
}

struct Harness {
    server: Server,
    _dir: tempfile::TempDir,
    path: PathBuf,
}

/// Starts a self-hosted server with the given namespaces fully
/// registered.
fn start_server(nspaces: &[(&str, i32)]) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pmix-test");
    let config = ServerConfig {
        rendezvous: Some(path.clone()),
        ..ServerConfig::default()
    };
    let server = Server::start(Box::new(SelfHost), config, log()).expect("server start");
    for (name, nprocs) in nspaces {
        server
            .register_nspace(
                name,
                *nprocs as usize,
                vec![
                    Info::new("pmix.univ.size", Value::Uint32(*nprocs as u32)),
                    Info::new("pmix.job.size", Value::Uint32(*nprocs as u32)),
                ],
            )
            .expect("register nspace");
        for rank in 0..*nprocs {
            server
                .register_client(name, rank, 1000, 1000)
                .expect("register client");
        }
    }
    Harness {
        server,
        _dir: dir,
        path,
    }
}

fn connect(harness: &Harness, nspace: &str, rank: i32) -> Client {
    Client::connect(&harness.path, nspace, rank, ClientConfig::default(), log())
        .expect("client connect")
}

#[test]
fn four_rank_fence_with_data_collection() {
    let harness = start_server(&[("S", 4)]);

    let mut workers = Vec::new();
    for rank in 0..4 {
        let client = connect(&harness, "S", rank);
        workers.push(thread::spawn(move || {
            client
                .put(Scope::Global, "k", Value::Int(rank))
                .expect("put");
            client.commit().expect("commit");
            client.fence(&[Range::all("S")], true).expect("fence");

            for other in 0..4 {
                let value = client.get("S", other, "k").expect("get");
                assert_eq!(value, Value::Int(other));
            }
            assert_eq!(
                client.get("S", 0, "does-not-exist"),
                Err(Status::NotFound)
            );
            client.finalize().expect("finalize");
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }
}

#[test]
fn kv_consistency_across_scopes_after_fence() {
    let harness = start_server(&[("scopes", 3)]);

    let mut workers = Vec::new();
    for rank in 0..3 {
        let client = connect(&harness, "scopes", rank);
        workers.push(thread::spawn(move || {
            client
                .put(
                    Scope::Local,
                    &format!("local-k-{}", rank),
                    Value::Int(12340 + rank),
                )
                .expect("put local");
            client
                .put(
                    Scope::Remote,
                    &format!("remote-k-{}", rank),
                    Value::String(format!("Test string #{}", rank)),
                )
                .expect("put remote");
            client
                .put(
                    Scope::Global,
                    &format!("global-k-{}", rank),
                    Value::Float(12.15 + rank as f32),
                )
                .expect("put global");
            client.commit().expect("commit");
            client.fence(&[Range::all("scopes")], true).expect("fence");

            for other in 0..3 {
                assert_eq!(
                    client
                        .get("scopes", other, &format!("local-k-{}", other))
                        .expect("get local"),
                    Value::Int(12340 + other)
                );
                assert_eq!(
                    client
                        .get("scopes", other, &format!("remote-k-{}", other))
                        .expect("get remote"),
                    Value::String(format!("Test string #{}", other))
                );
                assert_eq!(
                    client
                        .get("scopes", other, &format!("global-k-{}", other))
                        .expect("get global"),
                    Value::Float(12.15 + other as f32)
                );
            }
            client.finalize().expect("finalize");
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }
}

#[test]
fn publish_first_read_lookup() {
    let harness = start_server(&[("pub", 3)]);

    let publisher = connect(&harness, "pub", 0);
    publisher
        .publish(
            "svc",
            Persistence::FirstRead,
            &[Info::new(
                "port",
                Value::String("tcp://127.0.0.1:5000".into()),
            )],
        )
        .expect("publish");

    let first = connect(&harness, "pub", 1);
    let (owner, found) = first
        .lookup("svc", &["port"], false, None)
        .expect("first lookup");
    assert_eq!(owner, "pub");
    assert_eq!(
        found,
        vec![Info::new(
            "port",
            Value::String("tcp://127.0.0.1:5000".into())
        )]
    );

    // first_read: the entry is gone after one successful lookup.
    let second = connect(&harness, "pub", 2);
    assert_eq!(
        second.lookup("svc", &["port"], false, None),
        Err(Status::NotFound)
    );

    publisher.finalize().expect("finalize");
    first.finalize().expect("finalize");
    second.finalize().expect("finalize");
}

#[test]
fn connect_across_namespaces() {
    let harness = start_server(&[("A", 2), ("B", 2)]);
    let participants = vec![Range::all("A"), Range::all("B")];

    let mut workers = Vec::new();
    for (nspace, rank) in &[("A", 0), ("A", 1), ("B", 0), ("B", 1)] {
        let client = connect(&harness, nspace, *rank);
        let ranges = participants.clone();
        workers.push(thread::spawn(move || {
            client.connect_procs(&ranges).expect("connect");
            // The reply carried both namespaces' job-info blobs.
            assert_eq!(
                client.get("A", RANK_WILDCARD, "pmix.univ.size"),
                Ok(Value::Uint32(2))
            );
            assert_eq!(
                client.get("B", RANK_WILDCARD, "pmix.univ.size"),
                Ok(Value::Uint32(2))
            );
            client.disconnect_procs(&ranges).expect("disconnect");
            client.finalize().expect("finalize");
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }
}

#[test]
fn get_parks_until_owner_commits() {
    let harness = start_server(&[("park", 2)]);

    let owner = connect(&harness, "park", 0);
    owner.put(Scope::Global, "k", Value::Int(1)).expect("put");
    // No commit yet: a get from the other rank must park server-side.

    let reader = connect(&harness, "park", 1);
    let parked = thread::spawn(move || {
        let started = Instant::now();
        let value = reader.get("park", 0, "k").expect("parked get");
        let waited = started.elapsed();
        reader.finalize().expect("finalize");
        (value, waited)
    });

    thread::sleep(Duration::from_millis(200));
    owner.commit().expect("commit");
    owner
        .fence(&[Range::ranks("park", vec![0])], true)
        .expect("fence");

    let (value, waited) = parked.join().expect("parked thread");
    assert_eq!(value, Value::Int(1));
    assert!(waited >= Duration::from_millis(150));
    owner.finalize().expect("finalize");
}

#[test]
fn lookup_with_wait_times_out() {
    let harness = start_server(&[("waiter", 1)]);
    let client = connect(&harness, "waiter", 0);

    let started = Instant::now();
    let result = client.lookup("dir", &["x"], true, Some(Duration::from_millis(300)));
    assert_eq!(result, Err(Status::NotFound));
    assert!(started.elapsed() >= Duration::from_millis(250));

    client.finalize().expect("finalize");
}

#[test]
fn lookup_with_wait_sees_late_publish() {
    let harness = start_server(&[("late", 2)]);

    let reader = connect(&harness, "late", 0);
    let waiter = thread::spawn(move || {
        let found = reader
            .lookup("dir", &["x"], true, Some(Duration::from_secs(5)))
            .expect("waited lookup");
        reader.finalize().expect("finalize");
        found
    });

    thread::sleep(Duration::from_millis(150));
    let publisher = connect(&harness, "late", 1);
    publisher
        .publish(
            "dir",
            Persistence::Session,
            &[Info::new("x", Value::Int(99))],
        )
        .expect("publish");

    let (owner, found) = waiter.join().expect("waiter thread");
    assert_eq!(owner, "late");
    assert_eq!(found, vec![Info::new("x", Value::Int(99))]);
    publisher.finalize().expect("finalize");
}

#[test]
fn peer_disconnect_during_collective() {
    let harness = start_server(&[("drop", 5)]);

    // The doomed peer joins the fence first, then its socket dies.
    let doomed = connect(&harness, "drop", 4);
    let _pending = doomed.fence_nb(&[Range::all("drop")], true).expect("fence_nb");
    thread::sleep(Duration::from_millis(100));
    drop(doomed);
    thread::sleep(Duration::from_millis(100));

    let mut workers = Vec::new();
    for rank in 0..4 {
        let client = connect(&harness, "drop", rank);
        workers.push(thread::spawn(move || {
            client
                .put(Scope::Global, "k", Value::Int(rank))
                .expect("put");
            client.commit().expect("commit");
            // The tracker stops expecting the dead rank and still fires.
            client.fence(&[Range::all("drop")], true).expect("fence");
            for other in 0..4 {
                assert_eq!(
                    client.get("drop", other, "k").expect("get"),
                    Value::Int(other)
                );
            }
            client.finalize().expect("finalize");
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }
}

#[test]
fn handshake_version_mismatch_is_refused() {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let harness = start_server(&[("ver", 1)]);
    let mut stream = UnixStream::connect(&harness.path).expect("connect");

    // Identification frame with an incompatible major.minor.
    let mut payload = Vec::new();
    payload.extend_from_slice(b"ver\0");
    payload.extend_from_slice(&0i32.to_be_bytes());
    payload.push(0);
    payload.extend_from_slice(b"2.0.0\0");

    let hdr = Header::new(1, MSG_TYPE_IDENT, 0, payload.len() as u64);
    let mut raw = [0u8; HEADER_SIZE];
    hdr.write_to(&mut raw);
    stream.write_all(&raw).expect("send header");
    stream.write_all(&payload).expect("send payload");

    let mut reply_hdr = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply_hdr).expect("reply header");
    let reply_hdr = Header::read_from(&reply_hdr);
    let mut reply = vec![0u8; reply_hdr.nbytes as usize];
    stream.read_exact(&mut reply).expect("reply payload");

    let mut buf = Buffer::from_vec(pmix::codec::BufKind::FullyDesc, reply);
    let status = Status::from_i32(codec::unpack_one::<i32>(&mut buf).expect("status"));
    assert_eq!(status, Status::NotSupported);

    // The server closed the socket after refusing.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
}

#[test]
fn unknown_namespace_is_refused() {
    let harness = start_server(&[("known", 1)]);
    let result = Client::connect(
        &harness.path,
        "unknown",
        0,
        ClientConfig::default(),
        log(),
    );
    assert!(result.is_err());
    assert_eq!(result.err(), Some(Status::NotFound));
}

#[test]
fn unknown_rank_is_refused() {
    let harness = start_server(&[("small", 1)]);
    let result = Client::connect(&harness.path, "small", 7, ClientConfig::default(), log());
    assert_eq!(result.err(), Some(Status::NotFound));
}

#[test]
fn credential_validator_gates_admission() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pmix-cred");
    let config = ServerConfig {
        rendezvous: Some(path.clone()),
        validate_cred: Some(Box::new(|cred: &[u8]| {
            if cred == b"let-me-in" {
                Status::Success
            } else {
                Status::BadParam
            }
        })),
        ..ServerConfig::default()
    };
    let server = Server::start(Box::new(SelfHost), config, log()).expect("server");
    server.register_nspace("cred", 1, Vec::new()).expect("nspace");
    server.register_client("cred", 0, 0, 0).expect("client");

    let denied = Client::connect(&path, "cred", 0, ClientConfig::default(), log());
    assert_eq!(denied.err(), Some(Status::BadParam));

    let admitted = Client::connect(
        &path,
        "cred",
        0,
        ClientConfig {
            cred: b"let-me-in".to_vec(),
            ..ClientConfig::default()
        },
        log(),
    )
    .expect("admitted");
    admitted.finalize().expect("finalize");
}

#[test]
fn setup_fork_env_contract() {
    let harness = start_server(&[("fork", 1)]);
    let env = harness.server.setup_fork("fork", 0);
    let get = |key: &str| {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(get("PMIX_NAMESPACE"), Some("fork".to_string()));
    assert_eq!(get("PMIX_RANK"), Some("0".to_string()));
    assert_eq!(get("PMIX_SERVER_URI"), Some(harness.server.uri().to_string()));
    assert_eq!(get("PMIX_SECURITY_MODE"), Some("native".to_string()));
}

/// Self-serving host that additionally accepts spawns and records aborts.
struct RecordingHost {
    aborts: Arc<Mutex<Vec<(String, i32, String)>>>,
}

impl Host for RecordingHost {
    fn fence_nb(
        &mut self,
        _ranges: &[Range],
        _collect_data: bool,
        data: Vec<ModexData>,
        done: FenceDone,
    ) -> Status {
        done.complete(Status::Success, data);
        Status::Success
    }

    fn connect_nb(&mut self, _ranges: &[Range], done: OpDone) -> Status {
        done.complete(Status::Success);
        Status::Success
    }

    fn disconnect_nb(&mut self, _ranges: &[Range], done: OpDone) -> Status {
        done.complete(Status::Success);
        Status::Success
    }

    fn spawn_nb(&mut self, apps: Vec<App>, done: SpawnDone) -> Status {
        done.complete(Status::Success, format!("spawned-{}", apps.len()));
        Status::Success
    }

    fn client_aborted(&mut self, nspace: &str, rank: i32, _status: Status, msg: &str) -> Status {
        self.aborts
            .lock()
            .unwrap()
            .push((nspace.to_string(), rank, msg.to_string()));
        Status::Success
    }
}

fn start_recording_server(
    nspaces: &[(&str, i32)],
) -> (Harness, Arc<Mutex<Vec<(String, i32, String)>>>) {
    let aborts = Arc::new(Mutex::new(Vec::new()));
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pmix-test");
    let config = ServerConfig {
        rendezvous: Some(path.clone()),
        ..ServerConfig::default()
    };
    let host = RecordingHost {
        aborts: aborts.clone(),
    };
    let server = Server::start(Box::new(host), config, log()).expect("server start");
    for (name, nprocs) in nspaces {
        server
            .register_nspace(name, *nprocs as usize, Vec::new())
            .expect("register nspace");
        for rank in 0..*nprocs {
            server
                .register_client(name, rank, 1000, 1000)
                .expect("register client");
        }
    }
    (
        Harness {
            server,
            _dir: dir,
            path,
        },
        aborts,
    )
}

#[test]
fn spawn_delegates_to_host() {
    let (harness, _) = start_recording_server(&[("spawner", 1)]);
    let client = connect(&harness, "spawner", 0);

    let nspace = client
        .spawn(&[App {
            cmd: "/bin/worker".into(),
            argv: vec!["worker".into()],
            env: Vec::new(),
            maxprocs: 2,
        }])
        .expect("spawn");
    assert_eq!(nspace, "spawned-1");
    client.finalize().expect("finalize");
}

#[test]
fn spawn_without_host_support_is_refused() {
    let harness = start_server(&[("nospawn", 1)]);
    let client = connect(&harness, "nospawn", 0);
    let result = client.spawn(&[App {
        cmd: "/bin/true".into(),
        argv: Vec::new(),
        env: Vec::new(),
        maxprocs: 1,
    }]);
    assert_eq!(result, Err(Status::NotSupported));
    client.finalize().expect("finalize");
}

#[test]
fn abort_relays_to_host() {
    let (harness, aborts) = start_recording_server(&[("doom", 1)]);
    let client = connect(&harness, "doom", 0);

    client.abort(Status::Error, "unrecoverable").expect("abort");

    let recorded = aborts.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![("doom".to_string(), 0, "unrecoverable".to_string())]
    );
    drop(client);
}

#[test]
fn notify_error_reaches_clients() {
    let harness = start_server(&[("notify", 1)]);
    let client = connect(&harness, "notify", 0);

    let (tx, rx) = mpsc::channel();
    client.set_errhandler(Box::new(move |status, _ranges, _info| {
        let _ = tx.send(status);
    }));

    harness
        .server
        .notify_error(Status::CommFailure, Vec::new(), Vec::new())
        .expect("notify");

    let seen = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("notification");
    assert_eq!(seen, Status::CommFailure);
    client.finalize().expect("finalize");
}

#[test]
fn fence_without_collect_exchanges_nothing() {
    let harness = start_server(&[("bare", 2)]);

    let mut workers = Vec::new();
    for rank in 0..2 {
        let client = connect(&harness, "bare", rank);
        workers.push(thread::spawn(move || {
            client
                .put(Scope::Global, "quiet", Value::Int(rank))
                .expect("put");
            client.commit().expect("commit");
            client.fence(&[Range::all("bare")], false).expect("fence");
            // Nothing was circulated, but the server still serves gets
            // from its own store.
            let other = 1 - rank;
            assert_eq!(
                client.get("bare", other, "quiet").expect("get"),
                Value::Int(other)
            );
            client.finalize().expect("finalize");
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }
}
