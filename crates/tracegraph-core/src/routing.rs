//! Sticky run ownership across a worker pool.
//!
//! Every run maps to exactly one worker identity via a consistent hash ring
//! with virtual nodes, so one run's `GraphState` is only ever mutated by one
//! worker. Adding or removing a member only remaps ~1/N of the runs.
//!
//! ```
//! use tracegraph_core::routing::RunRouter;
//!
//! let router = RunRouter::new("w-1", ["w-1", "w-2", "w-3"], 128);
//! let owner = router.owner_of("run-42").unwrap();
//! assert_eq!(router.owns("run-42"), owner == "w-1");
//! ```

use std::collections::{BTreeMap, HashMap};

/// Consistent hash ring mapping run ids to worker identities.
#[derive(Debug, Clone)]
pub struct RunRouter {
    me: String,
    /// Ring position → member.
    ring: BTreeMap<u64, String>,
    positions: HashMap<String, Vec<u64>>,
    vnodes: u32,
}

impl RunRouter {
    /// `vnodes` is clamped to at least 1. An empty member list routes every
    /// run to `me`.
    #[must_use]
    pub fn new<I, S>(me: impl Into<String>, members: I, vnodes: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut router = Self {
            me: me.into(),
            ring: BTreeMap::new(),
            positions: HashMap::new(),
            vnodes: vnodes.max(1),
        };
        for member in members {
            router.add_member(member);
        }
        router
    }

    /// Router that owns everything.
    #[must_use]
    pub fn solo(me: impl Into<String>) -> Self {
        Self::new(me, Vec::<String>::new(), 1)
    }

    #[must_use]
    pub fn me(&self) -> &str {
        &self.me
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.positions.len()
    }

    /// No-op if already present.
    pub fn add_member(&mut self, member: impl Into<String>) {
        let member = member.into();
        if self.positions.contains_key(&member) {
            return;
        }
        let mut positions = Vec::with_capacity(self.vnodes as usize);
        for i in 0..self.vnodes {
            let hash = vnode_hash(&member, i);
            self.ring.insert(hash, member.clone());
            positions.push(hash);
        }
        self.positions.insert(member, positions);
    }

    /// Returns true if the member was present.
    pub fn remove_member(&mut self, member: &str) -> bool {
        let Some(positions) = self.positions.remove(member) else {
            return false;
        };
        for pos in positions {
            if self.ring.get(&pos).is_some_and(|m| m == member) {
                self.ring.remove(&pos);
            }
        }
        true
    }

    /// Member responsible for `run_id`; `None` on an empty ring.
    #[must_use]
    pub fn owner_of(&self, run_id: &str) -> Option<&str> {
        let hash = key_hash(run_id.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Whether this worker should claim `run_id`.
    #[must_use]
    pub fn owns(&self, run_id: &str) -> bool {
        self.owner_of(run_id).is_none_or(|owner| owner == self.me)
    }
}

fn vnode_hash(member: &str, vnode_idx: u32) -> u64 {
    let member_hash = fnv1a_hash(member.as_bytes());
    fmix64(member_hash ^ u64::from(vnode_idx).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Ring position of a key. FNV-1a alone keeps ids that differ in their last
/// byte close together, so the output is run through a finalizer.
fn key_hash(data: &[u8]) -> u64 {
    fmix64(fnv1a_hash(data))
}

/// FNV-1a 64-bit.
pub(crate) fn fnv1a_hash(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// MurmurHash3 64-bit finalizer.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
