//! Client-side mirror of unpacked job and exchange data. A client's own
//! puts are readable here before they commit, and fence/get replies land
//! here so repeated gets stay local.

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::codec::{self, BufKind, Buffer};
use crate::status::{PmixResult, Status};
use crate::types::{attr, Int, Kval, ModexData, Value, RANK_WILDCARD};

pub struct Cache {
    data: HashMap<(String, i32), IndexMap<String, Value>>,
}

impl Cache {
    pub fn new() -> Cache {
        Cache {
            data: HashMap::new(),
        }
    }

    pub fn put(&mut self, nspace: &str, rank: i32, key: String, value: Value) {
        self.data
            .entry((nspace.to_string(), rank))
            .or_insert_with(IndexMap::new)
            .insert(key, value);
    }

    /// Rank-specific data first, then job-level data recorded under the
    /// wildcard rank.
    pub fn get(&self, nspace: &str, rank: i32, key: &str) -> Option<Value> {
        if let Some(value) = self
            .data
            .get(&(nspace.to_string(), rank))
            .and_then(|bucket| bucket.get(key))
        {
            return Some(value.clone());
        }
        self.data
            .get(&(nspace.to_string(), RANK_WILDCARD))
            .and_then(|bucket| bucket.get(key))
            .cloned()
    }

    /// Decodes one rank's exchange blob into the mirror.
    pub fn absorb_modex(&mut self, modex: &ModexData) -> PmixResult<()> {
        let mut buf = Buffer::from_vec(BufKind::FullyDesc, modex.blob.clone());
        while !buf.is_exhausted() {
            let kval: Kval = codec::unpack_one(&mut buf)?;
            self.put(&modex.nspace, modex.rank, kval.key, kval.value);
        }
        Ok(())
    }

    /// Decodes a job-info blob: the namespace name, then job-level
    /// entries, with per-rank PROC_BLOB children unpacked under their
    /// rank. Returns the namespace the blob described.
    pub fn absorb_job_info(&mut self, buf: &mut Buffer) -> PmixResult<String> {
        let nspace: Option<String> = codec::unpack_one(buf)?;
        let nspace = nspace.ok_or(Status::UnpackFailure)?;
        while !buf.is_exhausted() {
            let kval: Kval = codec::unpack_one(buf)?;
            match (kval.key.as_str(), &kval.value) {
                (attr::PROC_BLOB, Value::ByteObject(blob)) => {
                    let mut child = Buffer::from_vec(BufKind::FullyDesc, blob.bytes.clone());
                    let rank = codec::unpack_one::<Int>(&mut child)?.0;
                    while !child.is_exhausted() {
                        let item: Kval = codec::unpack_one(&mut child)?;
                        self.put(&nspace, rank, item.key, item.value);
                    }
                }
                _ => self.put(&nspace, RANK_WILDCARD, kval.key, kval.value),
            }
        }
        Ok(nspace)
    }
}
