//! Server-side key/value store. One insertion-ordered bucket per
//! (namespace, rank); the owning server is the single writer, so no entry
//! level locking exists.

use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;

use crate::codec::{self, Buffer};
use crate::status::{PmixResult, Status};
use crate::types::{Kval, Scope, Value};

struct Entry {
    scope: Scope,
    value: Value,
}

pub struct KvStore {
    data: HashMap<(String, i32), IndexMap<String, Entry>>,
    committed: HashSet<(String, i32)>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore {
            data: HashMap::new(),
            committed: HashSet::new(),
        }
    }

    /// Stores one entry, replacing any prior value under the same key.
    /// When two commits race on one key, the later stream arrival wins;
    /// the store provides no ordering finer than the connection stream.
    pub fn put(&mut self, nspace: &str, rank: i32, scope: Scope, key: String, value: Value) {
        let bucket = self
            .data
            .entry((nspace.to_string(), rank))
            .or_insert_with(IndexMap::new);
        bucket.insert(key, Entry { scope, value });
    }

    /// Deep-copy point lookup. Unknown rank and missing key are both
    /// `NotFound`.
    pub fn get(&self, nspace: &str, rank: i32, key: &str) -> PmixResult<Value> {
        self.data
            .get(&(nspace.to_string(), rank))
            .and_then(|bucket| bucket.get(key))
            .map(|entry| entry.value.clone())
            .ok_or(Status::NotFound)
    }

    /// Deep-copies every entry held for the rank, in insertion order.
    pub fn get_all(&self, nspace: &str, rank: i32) -> PmixResult<Vec<Kval>> {
        let bucket = self
            .data
            .get(&(nspace.to_string(), rank))
            .ok_or(Status::NotFound)?;
        Ok(bucket
            .iter()
            .map(|(key, entry)| Kval::new(key.clone(), entry.value.clone()))
            .collect())
    }

    /// Removes one entry, or the whole rank bucket when no key is given.
    pub fn remove(&mut self, nspace: &str, rank: i32, key: Option<&str>) -> PmixResult<()> {
        let bucket_key = (nspace.to_string(), rank);
        match key {
            Some(key) => {
                let bucket = self.data.get_mut(&bucket_key).ok_or(Status::NotFound)?;
                bucket.shift_remove(key).ok_or(Status::NotFound)?;
                Ok(())
            }
            None => {
                self.data.remove(&bucket_key).ok_or(Status::NotFound)?;
                self.committed.remove(&bucket_key);
                Ok(())
            }
        }
    }

    /// Drops every bucket belonging to the namespace.
    pub fn remove_nspace(&mut self, nspace: &str) {
        self.data.retain(|(ns, _), _| ns != nspace);
        self.committed.retain(|(ns, _)| ns != nspace);
    }

    pub fn mark_committed(&mut self, nspace: &str, rank: i32) {
        self.committed.insert((nspace.to_string(), rank));
    }

    pub fn is_committed(&self, nspace: &str, rank: i32) -> bool {
        self.committed.contains(&(nspace.to_string(), rank))
    }

    /// Packs the rank's entries in the requested scopes into a blob for a
    /// collective contribution. Ranks with nothing stored produce an empty
    /// blob.
    pub fn blob_for(&self, nspace: &str, rank: i32, scopes: &[Scope]) -> PmixResult<Vec<u8>> {
        let mut buf = Buffer::fully_desc();
        if let Some(bucket) = self.data.get(&(nspace.to_string(), rank)) {
            for (key, entry) in bucket {
                if scopes.contains(&entry.scope) {
                    let kval = Kval::new(key.clone(), entry.value.clone());
                    codec::pack(&mut buf, &[kval])?;
                }
            }
        }
        Ok(buf.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut store = KvStore::new();
        store.put("job", 0, Scope::Global, "k".into(), Value::Int(5));
        assert_eq!(store.get("job", 0, "k"), Ok(Value::Int(5)));
        assert_eq!(store.get("job", 0, "missing"), Err(Status::NotFound));
        assert_eq!(store.get("job", 1, "k"), Err(Status::NotFound));
        assert_eq!(store.get("other", 0, "k"), Err(Status::NotFound));
    }

    #[test]
    fn test_put_replaces_in_place() {
        let mut store = KvStore::new();
        store.put("job", 0, Scope::Global, "a".into(), Value::Int(1));
        store.put("job", 0, Scope::Global, "b".into(), Value::Int(2));
        store.put("job", 0, Scope::Global, "a".into(), Value::Int(9));

        assert_eq!(store.get("job", 0, "a"), Ok(Value::Int(9)));
        let all = store.get_all("job", 0).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_get_all_preserves_insertion_order() {
        let mut store = KvStore::new();
        for i in 0..5 {
            store.put(
                "job",
                2,
                Scope::Local,
                format!("key-{}", i),
                Value::Int(i),
            );
        }
        let all = store.get_all("job", 2).unwrap();
        let keys: Vec<_> = all.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["key-0", "key-1", "key-2", "key-3", "key-4"]);
    }

    #[test]
    fn test_remove_key_and_bucket() {
        let mut store = KvStore::new();
        store.put("job", 0, Scope::Global, "a".into(), Value::Int(1));
        store.put("job", 0, Scope::Global, "b".into(), Value::Int(2));

        store.remove("job", 0, Some("a")).unwrap();
        assert_eq!(store.get("job", 0, "a"), Err(Status::NotFound));
        assert_eq!(store.get("job", 0, "b"), Ok(Value::Int(2)));

        store.remove("job", 0, None).unwrap();
        assert_eq!(store.get_all("job", 0), Err(Status::NotFound));
        assert_eq!(store.remove("job", 0, None), Err(Status::NotFound));
    }

    #[test]
    fn test_commit_tracking() {
        let mut store = KvStore::new();
        assert!(!store.is_committed("job", 0));
        store.mark_committed("job", 0);
        assert!(store.is_committed("job", 0));
        store.remove_nspace("job");
        assert!(!store.is_committed("job", 0));
    }

    #[test]
    fn test_blob_filters_by_scope() {
        let mut store = KvStore::new();
        store.put("job", 1, Scope::Local, "l".into(), Value::Int(1));
        store.put("job", 1, Scope::Remote, "r".into(), Value::Int(2));
        store.put("job", 1, Scope::Global, "g".into(), Value::Int(3));

        let blob = store
            .blob_for("job", 1, &[Scope::Remote, Scope::Global])
            .unwrap();
        let mut buf = Buffer::from_vec(crate::codec::BufKind::FullyDesc, blob);
        let mut keys = Vec::new();
        while !buf.is_exhausted() {
            let kval: Kval = codec::unpack_one(&mut buf).unwrap();
            keys.push(kval.key);
        }
        assert_eq!(keys, vec!["r", "g"]);
    }
}
