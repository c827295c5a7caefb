//! Namespace and rank registration. The registry owns every rank-info
//! record; peers refer to namespaces by arena index, and a slot is only
//! vacated by an explicit deregister.

use crate::codec::{self, Buffer};
use crate::logging::{self, Logger};
use crate::server::nodemap;
use crate::status::{PmixResult, Status};
use crate::types::{attr, Info, Int, Kval, Value};

pub struct RankInfo {
    pub rank: i32,
    pub uid: u32,
    pub gid: u32,
    /// Live peer connections from this rank. A rank may fork children that
    /// also initialize, so more than one connection is legal.
    pub proc_cnt: usize,
}

pub struct Nspace {
    pub name: String,
    pub nlocal: usize,
    pub all_registered: bool,
    pub ranks: Vec<RankInfo>,
    /// Packed once at registration, replayed to each connecting client.
    pub job_info: Buffer,
}

impl Nspace {
    pub fn rank_info(&self, rank: i32) -> Option<&RankInfo> {
        self.ranks.iter().find(|info| info.rank == rank)
    }

    pub fn rank_info_mut(&mut self, rank: i32) -> Option<&mut RankInfo> {
        self.ranks.iter_mut().find(|info| info.rank == rank)
    }

    pub fn local_ranks(&self) -> impl Iterator<Item = i32> + '_ {
        self.ranks.iter().map(|info| info.rank)
    }
}

pub struct Registry {
    nspaces: Vec<Option<Nspace>>,
    log: Logger,
}

impl Registry {
    pub fn new(log: Logger) -> Registry {
        Registry {
            nspaces: Vec::new(),
            log,
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.nspaces
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |ns| ns.name == name))
    }

    pub fn get(&self, idx: usize) -> Option<&Nspace> {
        self.nspaces.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Nspace> {
        self.nspaces.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Nspace> {
        self.nspaces.iter().filter_map(Option::as_ref)
    }

    /// Registers (or re-registers) a namespace and builds its job-info
    /// blob from the supplied attributes.
    pub fn register_nspace(
        &mut self,
        name: &str,
        nlocal: usize,
        info: &[Info],
    ) -> PmixResult<usize> {
        if name.is_empty() || name.len() > crate::types::MAX_NSLEN {
            return Err(Status::BadParam);
        }

        let job_info = self.build_job_info(name, info)?;

        if let Some(idx) = self.find(name) {
            let nspace = self.get_mut(idx).expect("Found index must be live");
            nspace.nlocal = nlocal;
            nspace.job_info = job_info;
            nspace.all_registered = nlocal > 0 && nspace.ranks.len() >= nlocal;
            logging::debug!(self.log, "re-registered nspace";
                            "nspace" => name, "nlocal" => nlocal);
            return Ok(idx);
        }

        let nspace = Nspace {
            name: name.to_string(),
            nlocal,
            all_registered: false,
            ranks: Vec::new(),
            job_info,
        };

        logging::debug!(self.log, "registered nspace"; "nspace" => name, "nlocal" => nlocal);

        match self.nspaces.iter().position(Option::is_none) {
            Some(idx) => {
                self.nspaces[idx] = Some(nspace);
                Ok(idx)
            }
            None => {
                self.nspaces.push(Some(nspace));
                Ok(self.nspaces.len() - 1)
            }
        }
    }

    /// Records one client rank. Returns the namespace index and whether
    /// this registration completed the expected local set.
    pub fn register_client(
        &mut self,
        name: &str,
        rank: i32,
        uid: u32,
        gid: u32,
    ) -> PmixResult<(usize, bool)> {
        let idx = match self.find(name) {
            Some(idx) => idx,
            // The host may register clients ahead of the nspace data.
            None => self.register_nspace(name, 0, &[])?,
        };
        let nspace = self.get_mut(idx).expect("Registered index must be live");
        if nspace.rank_info(rank).is_some() {
            return Err(Status::Exists);
        }
        nspace.ranks.push(RankInfo {
            rank,
            uid,
            gid,
            proc_cnt: 0,
        });
        let completed =
            !nspace.all_registered && nspace.nlocal > 0 && nspace.ranks.len() >= nspace.nlocal;
        if completed {
            nspace.all_registered = true;
        }
        let all_registered = nspace.all_registered;
        logging::debug!(self.log, "registered client";
                        "nspace" => name, "rank" => rank,
                        "all_registered" => all_registered);
        Ok((idx, completed))
    }

    /// Removes the namespace outright. The caller is responsible for
    /// having drained its peers first.
    pub fn deregister_nspace(&mut self, name: &str) -> PmixResult<()> {
        let idx = self.find(name).ok_or(Status::NotFound)?;
        self.nspaces[idx] = None;
        logging::debug!(self.log, "deregistered nspace"; "nspace" => name);
        Ok(())
    }

    fn build_job_info(&self, name: &str, info: &[Info]) -> PmixResult<Buffer> {
        let mut buf = Buffer::fully_desc();
        codec::pack(&mut buf, &[Some(name.to_string())])?;

        let mut nodes: Option<Vec<String>> = None;
        let mut procs: Option<Vec<Vec<i32>>> = None;

        for entry in info {
            match entry.key.as_str() {
                attr::NODE_MAP => {
                    let regex = match &entry.value {
                        Value::String(s) => s,
                        _ => return Err(Status::BadParam),
                    };
                    nodes = Some(nodemap::parse_nodes(regex)?);
                }
                attr::PROC_MAP => {
                    let regex = match &entry.value {
                        Value::String(s) => s,
                        _ => return Err(Status::BadParam),
                    };
                    procs = Some(nodemap::parse_procs(regex)?);
                }
                attr::PROC_DATA => {
                    self.pack_proc_data(&mut buf, entry)?;
                }
                _ => {
                    codec::pack(&mut buf, &[Kval::new(entry.key.clone(), entry.value.clone())])?;
                }
            }
            // Once both maps have arrived, record the decompressed forms.
            if nodes.is_some() && procs.is_some() {
                let node_list = nodes.take().expect("Node map must be present");
                let proc_list = procs.take().expect("Proc map must be present");
                self.pack_proc_map(&mut buf, node_list, proc_list)?;
            }
        }

        Ok(buf)
    }

    /// Records the decompressed node and proc maps as named entries.
    fn pack_proc_map(
        &self,
        buf: &mut Buffer,
        nodes: Vec<String>,
        procs: Vec<Vec<i32>>,
    ) -> PmixResult<()> {
        if nodes.len() != procs.len() {
            return Err(Status::BadParam);
        }
        let peers: Vec<String> = procs
            .iter()
            .map(|ranks| {
                ranks
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        codec::pack(buf, &[Kval::new(attr::NODE_MAP, Value::StringArray(nodes))])?;
        codec::pack(buf, &[Kval::new(attr::PROC_MAP, Value::StringArray(peers))])?;
        Ok(())
    }

    /// A PROC_DATA entry carries a nested info array whose first element
    /// must be the rank; the rest packs into a per-rank child blob.
    fn pack_proc_data(&self, buf: &mut Buffer, entry: &Info) -> PmixResult<()> {
        let array = match &entry.value {
            Value::InfoArray(array) => array,
            _ => return Err(Status::BadParam),
        };
        let first = array.first().ok_or(Status::BadParam)?;
        if first.key != attr::RANK {
            return Err(Status::BadParam);
        }
        let rank = match first.value {
            Value::Int(rank) => rank,
            Value::Int32(rank) => rank,
            _ => return Err(Status::BadParam),
        };

        let mut child = Buffer::fully_desc();
        codec::pack(&mut child, &[Int(rank)])?;
        for item in &array[1..] {
            codec::pack(
                &mut child,
                &[Kval::new(item.key.clone(), item.value.clone())],
            )?;
        }

        codec::pack(
            buf,
            &[Kval::new(
                attr::PROC_BLOB,
                Value::ByteObject(crate::types::ByteObject::new(child.into_vec())),
            )],
        )
    }
}
