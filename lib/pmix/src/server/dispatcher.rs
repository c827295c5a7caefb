//! Command switchyard. Incoming peer messages decode into an opcode and
//! route to a handler; every error short-circuits into a status-only reply
//! on the request's tag.

use std::time::{Duration, Instant};

use crate::codec::{self, Buffer};
use crate::logging;
use crate::server::tracker::{CollectiveKind, LocalPart};
use crate::server::{PendingGet, PendingLookup, ServerLoop};
use crate::status::{PmixResult, Status};
use crate::types::{App, Cmd, Int, Kval, Persistence, Range, Scope, Size};

impl ServerLoop {
    /// Routes one fully received message. An `Err` here becomes a
    /// status-only reply to the caller.
    pub(crate) fn dispatch(&mut self, index: usize, tag: u32, buf: &mut Buffer) -> PmixResult<()> {
        let raw: u32 = codec::unpack_one(buf)?;
        let cmd = Cmd::from_u32(raw).ok_or(Status::NotSupported)?;

        let (nspace, rank) = {
            let peer = self
                .peers
                .get(index)
                .and_then(Option::as_ref)
                .ok_or(Status::NotFound)?;
            (peer.nspace.clone(), peer.rank)
        };

        logging::trace!(self.log, "dispatching command";
                        "cmd" => ?cmd, "nspace" => &nspace, "rank" => rank, "tag" => tag);

        match cmd {
            Cmd::Abort => self.handle_abort(index, tag, &nspace, rank, buf),
            Cmd::Commit => self.handle_commit(&nspace, rank, buf),
            Cmd::FenceNb => self.handle_collective(index, tag, CollectiveKind::Fence, buf),
            Cmd::GetNb => self.handle_get(index, tag, buf),
            Cmd::Finalize => self.handle_finalize(index, tag, &nspace, rank),
            Cmd::PublishNb => self.handle_publish(index, tag, &nspace, buf),
            Cmd::LookupNb => self.handle_lookup(index, tag, buf),
            Cmd::UnpublishNb => self.handle_unpublish(index, tag, &nspace, buf),
            Cmd::SpawnNb => self.handle_spawn(index, tag, buf),
            Cmd::ConnectNb => self.handle_collective(index, tag, CollectiveKind::Connect, buf),
            Cmd::DisconnectNb => {
                self.handle_collective(index, tag, CollectiveKind::Disconnect, buf)
            }
        }
    }

    /// Abort: relay to the host, answer with its verdict, then stop
    /// reading from this peer.
    fn handle_abort(
        &mut self,
        index: usize,
        tag: u32,
        nspace: &str,
        rank: i32,
        buf: &mut Buffer,
    ) -> PmixResult<()> {
        let status_code: i32 = codec::unpack_one(buf)?;
        let msg: Option<String> = codec::unpack_one(buf)?;
        let verdict = self.host.client_aborted(
            nspace,
            rank,
            Status::from_i32(status_code),
            msg.as_deref().unwrap_or(""),
        );
        self.post_status_reply(index, tag, verdict);
        if verdict.is_success() {
            self.disable_read(index);
        }
        Ok(())
    }

    /// Commit: append the peer's staged per-scope buffers into its rank's
    /// entries, then wake any gets parked on that rank. No reply beyond
    /// failure.
    fn handle_commit(&mut self, nspace: &str, rank: i32, buf: &mut Buffer) -> PmixResult<()> {
        while !buf.is_exhausted() {
            let scope = Scope::from_u8(codec::unpack_one::<u8>(buf)?)?;
            let mut staged: Buffer = codec::unpack_one(buf)?;
            while !staged.is_exhausted() {
                let kval: Kval = codec::unpack_one(&mut staged)?;
                self.kvstore.put(nspace, rank, scope, kval.key, kval.value);
            }
        }
        self.kvstore.mark_committed(nspace, rank);
        logging::debug!(self.log, "commit stored"; "nspace" => nspace, "rank" => rank);
        self.wake_pending_gets(nspace, rank);
        Ok(())
    }

    /// Fence/connect/disconnect all share the tracker machinery: match or
    /// create by signature, append this peer, and fire once the local set
    /// is complete.
    fn handle_collective(
        &mut self,
        index: usize,
        tag: u32,
        kind: CollectiveKind,
        buf: &mut Buffer,
    ) -> PmixResult<()> {
        let nranges: Size = codec::unpack_one(buf)?;
        let mut ranges: Vec<Range> = Vec::new();
        codec::unpack(buf, &mut ranges, nranges.0 as i32)?;
        if ranges.is_empty() {
            return Err(Status::BadParam);
        }
        let collect_data = if kind == CollectiveKind::Fence {
            codec::unpack_one::<bool>(buf)?
        } else {
            false
        };

        // Every named namespace must be known from prior registration.
        for range in &ranges {
            if self.registry.find(&range.nspace).is_none() {
                return Err(Status::NotFound);
            }
        }

        let (nspace, rank) = {
            let peer = self
                .peers
                .get(index)
                .and_then(Option::as_ref)
                .ok_or(Status::NotFound)?;
            (peer.nspace.clone(), peer.rank)
        };

        let (id, created) = self.trackers.find_or_create(kind, &ranges);
        {
            let tracker = self
                .trackers
                .get_mut(id)
                .expect("Tracker was just resolved");
            if !tracker.includes(&nspace, rank) {
                if created {
                    self.trackers.remove(id);
                }
                return Err(Status::BadParam);
            }
            tracker.collect_data |= collect_data;
            tracker.locals.push(LocalPart {
                peer: index,
                tag,
                nspace,
                rank,
            });
        }
        self.update_tracker(id);
        Ok(())
    }

    /// Get: serve from the local store once the owner committed, park on
    /// an uncommitted local rank, or escalate anything else to the host.
    fn handle_get(&mut self, index: usize, tag: u32, buf: &mut Buffer) -> PmixResult<()> {
        let nspace: Option<String> = codec::unpack_one(buf)?;
        let nspace = nspace.ok_or(Status::BadParam)?;
        let rank = codec::unpack_one::<Int>(buf)?.0;
        let key: Option<String> = codec::unpack_one(buf)?;
        if let Some(key) = &key {
            if key.len() > crate::types::MAX_KEYLEN {
                return Err(Status::BadParam);
            }
        }

        let ns_idx = self.registry.find(&nspace);
        let local_rank = ns_idx
            .and_then(|idx| self.registry.get(idx))
            .map_or(false, |ns| ns.rank_info(rank).is_some());

        if local_rank {
            if self.kvstore.is_committed(&nspace, rank) {
                self.reply_local_get(index, tag, &nspace, rank, key.as_deref());
            } else {
                logging::debug!(self.log, "parking get on uncommitted rank";
                                "nspace" => &nspace, "rank" => rank, "peer" => index);
                self.pending_gets.push(PendingGet {
                    peer: index,
                    tag,
                    nspace,
                    rank,
                    key,
                });
            }
            return Ok(());
        }

        // Not resolvable here; the host may know the rank.
        let done = crate::server::host::GetDone {
            waker: self.waker.clone(),
            peer: index,
            tag,
        };
        let verdict = self.host.get_nb(&nspace, rank, done);
        verdict.as_result()
    }

    /// Finalize: notify the host and disable the read side; the peer
    /// closes the socket shortly after the reply.
    fn handle_finalize(
        &mut self,
        index: usize,
        tag: u32,
        nspace: &str,
        rank: i32,
    ) -> PmixResult<()> {
        let verdict = self.host.client_finalized(nspace, rank);
        self.post_status_reply(index, tag, verdict);
        self.disable_read(index);
        Ok(())
    }

    fn handle_publish(
        &mut self,
        index: usize,
        tag: u32,
        nspace: &str,
        buf: &mut Buffer,
    ) -> PmixResult<()> {
        let service: Option<String> = codec::unpack_one(buf)?;
        let service = service.ok_or(Status::BadParam)?;
        let persistence = Persistence::from_u8(codec::unpack_one::<u8>(buf)?)?;
        let ninfo: Size = codec::unpack_one(buf)?;
        let mut infos = Vec::new();
        codec::unpack(buf, &mut infos, ninfo.0 as i32)?;

        self.directory
            .publish(&service, persistence, nspace, infos)?;
        logging::debug!(self.log, "published"; "service" => &service, "owner" => nspace);
        self.post_status_reply(index, tag, Status::Success);
        // Fresh data may satisfy lookups waiting on these keys.
        self.scan_pending_lookups();
        Ok(())
    }

    fn handle_lookup(&mut self, index: usize, tag: u32, buf: &mut Buffer) -> PmixResult<()> {
        let service: Option<String> = codec::unpack_one(buf)?;
        let service = service.ok_or(Status::BadParam)?;
        let nkeys: Size = codec::unpack_one(buf)?;
        let mut raw_keys: Vec<Option<String>> = Vec::new();
        codec::unpack(buf, &mut raw_keys, nkeys.0 as i32)?;
        let keys: Vec<String> = raw_keys.into_iter().flatten().collect();
        let wait = codec::unpack_one::<bool>(buf)?;
        let timeout_ms: i64 = codec::unpack_one(buf)?;

        if keys.is_empty() {
            return Err(Status::BadParam);
        }

        if self.directory.all_present(&service, &keys) {
            self.reply_lookup(index, tag, &service, &keys);
            return Ok(());
        }
        if !wait {
            return Err(Status::NotFound);
        }

        let timer = if timeout_ms > 0 {
            Some(
                self.timers
                    .schedule(Instant::now() + Duration::from_millis(timeout_ms as u64)),
            )
        } else {
            None
        };
        logging::debug!(self.log, "parking lookup";
                        "service" => &service, "peer" => index, "timeout_ms" => timeout_ms);
        self.pending_lookups.push(PendingLookup {
            peer: index,
            tag,
            service,
            keys,
            timer,
        });
        Ok(())
    }

    fn handle_unpublish(
        &mut self,
        index: usize,
        tag: u32,
        nspace: &str,
        buf: &mut Buffer,
    ) -> PmixResult<()> {
        let service: Option<String> = codec::unpack_one(buf)?;
        let service = service.unwrap_or_default();
        let nkeys: Size = codec::unpack_one(buf)?;
        let mut raw_keys: Vec<Option<String>> = Vec::new();
        codec::unpack(buf, &mut raw_keys, nkeys.0 as i32)?;
        let keys: Vec<String> = raw_keys.into_iter().flatten().collect();
        let scoped = codec::unpack_one::<bool>(buf)?;
        let persistence = if scoped {
            Some(Persistence::from_u8(codec::unpack_one::<u8>(buf)?)?)
        } else {
            None
        };

        self.directory
            .unpublish(nspace, &service, &keys, persistence)?;
        self.post_status_reply(index, tag, Status::Success);
        Ok(())
    }

    /// Spawn: delegated to the host; the reply arrives asynchronously
    /// with the new namespace.
    fn handle_spawn(&mut self, index: usize, tag: u32, buf: &mut Buffer) -> PmixResult<()> {
        let napps: Size = codec::unpack_one(buf)?;
        let mut apps: Vec<App> = Vec::new();
        codec::unpack(buf, &mut apps, napps.0 as i32)?;
        if apps.is_empty() {
            return Err(Status::BadParam);
        }
        let done = crate::server::host::SpawnDone {
            waker: self.waker.clone(),
            peer: index,
            tag,
        };
        self.host.spawn_nb(apps, done).as_result()
    }

    fn disable_read(&mut self, index: usize) {
        if let Some(peer) = self.peers.get_mut(index).and_then(Option::as_mut) {
            peer.read_enabled = false;
        }
        self.update_peer_registration(index);
    }
}
