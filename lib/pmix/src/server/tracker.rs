//! In-flight collective state. Concurrent requests with the same type and
//! participant set share one tracker; the tracker fires once, replies once
//! per local participant, then leaves the active list.

use hashbrown::HashSet;
use indexmap::IndexSet;

use crate::types::{Range, RANK_WILDCARD};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CollectiveKind {
    Fence,
    Connect,
    Disconnect,
}

/// One locally connected participant awaiting the tracker's reply, in join
/// order.
#[derive(Debug, Clone)]
pub struct LocalPart {
    pub peer: usize,
    pub tag: u32,
    pub nspace: String,
    pub rank: i32,
}

pub struct Tracker {
    pub id: u64,
    pub kind: CollectiveKind,
    sig: IndexSet<(String, i32)>,
    pub ranges: Vec<Range>,
    pub collect_data: bool,
    pub locals: Vec<LocalPart>,
    /// Participants whose peer died mid-flight; no longer expected.
    pub removed: HashSet<(String, i32)>,
    pub def_complete: bool,
    pub fired: bool,
}

impl Tracker {
    /// Canonical signature: the sorted, deduplicated participant list. A
    /// range without explicit ranks contributes a namespace wildcard.
    fn signature(ranges: &[Range]) -> IndexSet<(String, i32)> {
        let mut sig: Vec<(String, i32)> = Vec::new();
        for range in ranges {
            if range.ranks.is_empty() {
                sig.push((range.nspace.clone(), RANK_WILDCARD));
            } else {
                for &rank in &range.ranks {
                    sig.push((range.nspace.clone(), rank));
                }
            }
        }
        sig.sort();
        sig.dedup();
        sig.into_iter().collect()
    }

    /// True when the participant set names this (namespace, rank), either
    /// explicitly or through a namespace wildcard.
    pub fn includes(&self, nspace: &str, rank: i32) -> bool {
        self.sig.contains(&(nspace.to_string(), rank))
            || self.sig.contains(&(nspace.to_string(), RANK_WILDCARD))
    }

    /// Namespaces named by the participant set, in signature order.
    pub fn nspaces(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (nspace, _) in &self.sig {
            if !out.iter().any(|existing| existing == nspace) {
                out.push(nspace.clone());
            }
        }
        out
    }

    pub fn has_local(&self, nspace: &str, rank: i32) -> bool {
        self.locals
            .iter()
            .any(|part| part.nspace == nspace && part.rank == rank)
    }

    /// Drops a disconnected peer from the locals list and stops expecting
    /// its (namespace, rank) so the collective can still fire.
    pub fn drop_peer(&mut self, peer: usize) {
        let mut dropped: Vec<(String, i32)> = Vec::new();
        self.locals.retain(|part| {
            if part.peer == peer {
                dropped.push((part.nspace.clone(), part.rank));
                false
            } else {
                true
            }
        });
        for key in dropped {
            self.removed.insert(key);
        }
    }

    pub fn is_removed(&self, nspace: &str, rank: i32) -> bool {
        self.removed.contains(&(nspace.to_string(), rank))
    }
}

pub struct Trackers {
    active: Vec<Tracker>,
    next_id: u64,
}

impl Trackers {
    pub fn new() -> Trackers {
        Trackers {
            active: Vec::new(),
            next_id: 0,
        }
    }

    /// Finds the tracker matching this request's type and canonical
    /// participant signature, creating one on first arrival. Returns the
    /// tracker id and whether it was newly created.
    pub fn find_or_create(&mut self, kind: CollectiveKind, ranges: &[Range]) -> (u64, bool) {
        let sig = Tracker::signature(ranges);
        if let Some(tracker) = self
            .active
            .iter()
            .find(|t| t.kind == kind && t.sig == sig && !t.fired)
        {
            return (tracker.id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.active.push(Tracker {
            id,
            kind,
            sig,
            ranges: ranges.to_vec(),
            collect_data: false,
            locals: Vec::new(),
            removed: HashSet::new(),
            def_complete: false,
            fired: false,
        });
        (id, true)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Tracker> {
        self.active.iter_mut().find(|t| t.id == id)
    }

    pub fn get(&self, id: u64) -> Option<&Tracker> {
        self.active.iter().find(|t| t.id == id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Tracker> {
        let pos = self.active.iter().position(|t| t.id == id)?;
        Some(self.active.remove(pos))
    }

    pub fn ids(&self) -> Vec<u64> {
        self.active.iter().map(|t| t.id).collect()
    }

    pub fn drop_peer(&mut self, peer: usize) {
        for tracker in &mut self.active {
            tracker.drop_peer(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence_ranges() -> Vec<Range> {
        vec![Range::ranks("job", vec![0, 1, 2])]
    }

    #[test]
    fn test_dedup_by_signature() {
        let mut trackers = Trackers::new();
        let (first, created) = trackers.find_or_create(CollectiveKind::Fence, &fence_ranges());
        assert!(created);

        // Same participants in a different order map to the same tracker.
        let reordered = vec![Range::ranks("job", vec![2, 0, 1, 0])];
        let (second, created) = trackers.find_or_create(CollectiveKind::Fence, &reordered);
        assert!(!created);
        assert_eq!(first, second);

        // A different type gets its own tracker.
        let (third, created) = trackers.find_or_create(CollectiveKind::Connect, &fence_ranges());
        assert!(created);
        assert_ne!(first, third);
    }

    #[test]
    fn test_wildcard_membership() {
        let mut trackers = Trackers::new();
        let (id, _) = trackers.find_or_create(CollectiveKind::Fence, &[Range::all("job")]);
        let tracker = trackers.get(id).unwrap();
        assert!(tracker.includes("job", 0));
        assert!(tracker.includes("job", 99));
        assert!(!tracker.includes("other", 0));
    }

    #[test]
    fn test_drop_peer_stops_expecting_rank() {
        let mut trackers = Trackers::new();
        let (id, _) = trackers.find_or_create(CollectiveKind::Fence, &fence_ranges());
        {
            let tracker = trackers.get_mut(id).unwrap();
            tracker.locals.push(LocalPart {
                peer: 4,
                tag: 9,
                nspace: "job".into(),
                rank: 1,
            });
        }
        trackers.drop_peer(4);
        let tracker = trackers.get(id).unwrap();
        assert!(tracker.locals.is_empty());
        assert!(tracker.is_removed("job", 1));
        assert!(!tracker.is_removed("job", 0));
    }

    #[test]
    fn test_fired_tracker_not_reused() {
        let mut trackers = Trackers::new();
        let (first, _) = trackers.find_or_create(CollectiveKind::Fence, &fence_ranges());
        trackers.get_mut(first).unwrap().fired = true;
        let (second, created) = trackers.find_or_create(CollectiveKind::Fence, &fence_ranges());
        assert!(created);
        assert_ne!(first, second);
    }

    #[test]
    fn test_remove() {
        let mut trackers = Trackers::new();
        let (id, _) = trackers.find_or_create(CollectiveKind::Disconnect, &fence_ranges());
        assert!(trackers.remove(id).is_some());
        assert!(trackers.remove(id).is_none());
        assert!(trackers.ids().is_empty());
    }

    #[test]
    fn test_nspaces_in_order() {
        let mut trackers = Trackers::new();
        let ranges = vec![Range::all("beta"), Range::all("alpha")];
        let (id, _) = trackers.find_or_create(CollectiveKind::Connect, &ranges);
        // Signature sorting puts the namespaces in canonical order.
        assert_eq!(trackers.get(id).unwrap().nspaces(), vec!["alpha", "beta"]);
    }
}
