//! Replica and extent accounting for pointer keys.
//!
//! New pointers are registered with their replica set before they can become
//! reachable; at commit, every pointer inserted or overwritten by a topology
//! change passes through [trans_mark_key] so per-device sector usage tracks
//! the pointer set exactly.

use crate::bkey::{NodeKey, PtrKey};
use log::trace;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Insert,
    Overwrite,
}

#[derive(Default)]
struct ReplicaState {
    /// Known replica sets, as sorted device lists.
    entries: HashSet<Vec<u8>>,
    /// Signed sector usage per device.
    sectors: HashMap<u8, i64>,
}

#[derive(Default)]
pub struct Replicas {
    state: Mutex<ReplicaState>,
}

impl Replicas {
    /// Record the replica set of a new pointer key.
    pub fn mark_bkey_replicas(&self, ptr: &PtrKey) {
        let mut devs: Vec<u8> = ptr.ptrs().iter().map(|p| p.dev).collect();
        devs.sort_unstable();
        devs.dedup();
        self.state.lock().entries.insert(devs);
    }

    pub fn has_replicas(&self, ptr: &PtrKey) -> bool {
        let mut devs: Vec<u8> = ptr.ptrs().iter().map(|p| p.dev).collect();
        devs.sort_unstable();
        devs.dedup();
        self.state.lock().entries.contains(&devs)
    }

    /// Transactional mark of a pointer key at commit time.
    pub fn trans_mark_key(&self, key: &NodeKey, sectors: u32, trigger: Trigger) {
        let Some(ptr) = key.ptr() else { return };
        let delta = match trigger {
            Trigger::Insert => sectors as i64,
            Trigger::Overwrite => -(sectors as i64),
        };
        let mut s = self.state.lock();
        for p in ptr.ptrs() {
            *s.sectors.entry(p.dev).or_insert(0) += delta;
        }
        trace!("trans_mark {:?} at {}: {} sectors", trigger, key.pos, delta);
    }

    /// Net marked sectors summed over all devices.
    pub fn net_sectors(&self) -> i64 {
        self.state.lock().sectors.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{DiskPtr, KeyPos};

    #[test]
    fn insert_then_overwrite_nets_zero() {
        let r = Replicas::default();
        let ptr = PtrKey::V1 {
            ptrs: vec![DiskPtr { dev: 0, offset: 0 }, DiskPtr { dev: 1, offset: 0 }],
        };
        let key = NodeKey::new_ptr(KeyPos::new(0, 10), ptr.clone());
        r.mark_bkey_replicas(&ptr);
        assert!(r.has_replicas(&ptr));
        r.trans_mark_key(&key, 64, Trigger::Insert);
        assert_eq!(r.net_sectors(), 128);
        r.trans_mark_key(&key, 64, Trigger::Overwrite);
        assert_eq!(r.net_sectors(), 0);
    }
}
