//! The host interface. The workload manager that launched the server
//! implements this trait; completions are delivered through handles that
//! post back into the progress thread, never by calling server internals
//! from the host's context.

use crate::event::Waker;
use crate::server::ServerOp;
use crate::status::Status;
use crate::types::{App, ModexData, Range};

/// Completion handle for a fence collective. Consuming it posts the result
/// into the progress thread, which fans the reply out to every tracked
/// participant.
pub struct FenceDone {
    pub(crate) waker: Waker<ServerOp>,
    pub(crate) tracker: u64,
}

impl FenceDone {
    pub fn complete(self, status: Status, data: Vec<ModexData>) {
        let _ = self.waker.post(ServerOp::FenceComplete {
            tracker: self.tracker,
            status,
            data,
        });
    }
}

/// Completion handle for connect/disconnect collectives.
pub struct OpDone {
    pub(crate) waker: Waker<ServerOp>,
    pub(crate) tracker: u64,
}

impl OpDone {
    pub fn complete(self, status: Status) {
        let _ = self.waker.post(ServerOp::OpComplete {
            tracker: self.tracker,
            status,
        });
    }
}

/// Completion handle for a spawn request, carrying the new namespace.
pub struct SpawnDone {
    pub(crate) waker: Waker<ServerOp>,
    pub(crate) peer: usize,
    pub(crate) tag: u32,
}

impl SpawnDone {
    pub fn complete(self, status: Status, nspace: String) {
        let _ = self.waker.post(ServerOp::SpawnComplete {
            peer: self.peer,
            tag: self.tag,
            status,
            nspace,
        });
    }
}

/// Completion handle for a get escalated beyond the local store.
pub struct GetDone {
    pub(crate) waker: Waker<ServerOp>,
    pub(crate) peer: usize,
    pub(crate) tag: u32,
}

impl GetDone {
    pub fn complete(self, status: Status, data: Vec<ModexData>) {
        let _ = self.waker.post(ServerOp::GetComplete {
            peer: self.peer,
            tag: self.tag,
            status,
            data,
        });
    }
}

/// Callbacks into the system that owns job topology. A returned status
/// other than `Success` means the request was not accepted and no
/// completion will follow.
pub trait Host: Send {
    /// Run the fence across every node hosting a participant. `data` holds
    /// the local contributions; the completion carries the combined set.
    fn fence_nb(
        &mut self,
        ranges: &[Range],
        collect_data: bool,
        data: Vec<ModexData>,
        done: FenceDone,
    ) -> Status;

    fn connect_nb(&mut self, ranges: &[Range], done: OpDone) -> Status;

    fn disconnect_nb(&mut self, ranges: &[Range], done: OpDone) -> Status;

    fn spawn_nb(&mut self, apps: Vec<App>, done: SpawnDone) -> Status {
        let _ = (apps, done);
        Status::NotSupported
    }

    /// Resolve data the local store cannot: an unknown namespace or a rank
    /// hosted on another node.
    fn get_nb(&mut self, nspace: &str, rank: i32, done: GetDone) -> Status {
        let _ = (nspace, rank, done);
        Status::NotFound
    }

    fn client_aborted(&mut self, nspace: &str, rank: i32, status: Status, msg: &str) -> Status {
        let _ = (nspace, rank, status, msg);
        Status::Success
    }

    fn client_finalized(&mut self, nspace: &str, rank: i32) -> Status {
        let _ = (nspace, rank);
        Status::Success
    }

    /// Allocate a namespace for a tool connection. `None` rejects the
    /// tool outright; the handshake does not proceed until the host has
    /// answered.
    fn allocate_tool_nspace(&mut self) -> Option<String> {
        None
    }
}

/// Host for a server that serves only its own node: collectives involve no
/// other server, so the local contributions are the combined result.
pub struct SelfHost;

impl Host for SelfHost {
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
}
