//! The btree node cache.
//!
//! Nodes are found by the XxHash64 of their pointer key. The cache owns the
//! LRU used to bound in-memory descriptors; allocation of a new descriptor
//! may cannibalise the LRU tail, serialised by the cannibalise lock so a
//! burst of node allocations from concurrent updates cannot starve each
//! other of descriptors.

use crate::{
    bkey::PtrKey,
    node::{flags, Node},
    BtreeId,
};
use log::trace;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::{HashMap, VecDeque},
    hash::Hasher,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use twox_hash::XxHash64;

pub fn ptr_hash(ptr: &PtrKey) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(&bincode::serialize(ptr).expect("ptr serializes"));
    h.finish()
}

struct CacheState {
    table: HashMap<u64, Arc<Node>>,
    /// Front is the eviction candidate.
    lru: VecDeque<u64>,
    freeable: Vec<Arc<Node>>,
}

pub struct NodeCache {
    capacity: usize,
    state: Mutex<CacheState>,
    cannibalize: Mutex<()>,
    next_nid: AtomicU64,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        NodeCache {
            capacity,
            state: Mutex::new(CacheState {
                table: HashMap::new(),
                lru: VecDeque::new(),
                freeable: Vec::new(),
            }),
            cannibalize: Mutex::new(()),
            next_nid: AtomicU64::new(1),
        }
    }

    /// Serialises descriptor cannibalisation across updates filling their
    /// node reserves.
    pub fn cannibalize_lock(&self) -> MutexGuard<'_, ()> {
        self.cannibalize.lock()
    }

    /// Obtain a fresh descriptor, locked intent+write. The caller is
    /// expected to hold the cannibalise lock when allocating in bulk.
    pub fn mem_alloc(&self, btree_id: BtreeId, level: u8, ptr: PtrKey) -> Arc<Node> {
        {
            let mut s = self.state.lock();
            if s.table.len() >= self.capacity {
                self.cannibalize_one(&mut s);
            }
            // Descriptors on the freeable list are recycled by identity
            // only; their contents are dead.
            s.freeable.pop();
        }
        let nid = self.next_nid.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(Node::new(nid, btree_id, level, ptr));
        node.flag_set(flags::FAKE);
        node.lock.lock_intent();
        node.lock.lock_write();
        node
    }

    fn cannibalize_one(&self, s: &mut CacheState) {
        let mut scanned = 0;
        while let Some(hash) = s.lru.pop_front() {
            scanned += 1;
            let Some(node) = s.table.get(&hash).cloned() else {
                continue;
            };
            let evictable = !node.flag(flags::NOEVICT)
                && !node.flag(flags::DIRTY)
                && node.will_make_reachable().is_none()
                && node.lock.try_lock_intent();
            if evictable {
                node.lock.unlock_intent();
                s.table.remove(&hash);
                trace!("cache: cannibalised node {}", node.nid);
                return;
            }
            s.lru.push_back(hash);
            if scanned >= s.lru.len() + 1 {
                return;
            }
        }
    }

    pub fn hash_insert(&self, node: &Arc<Node>) {
        let hash = ptr_hash(&node.data.lock().ptr);
        let mut s = self.state.lock();
        s.table.insert(hash, node.clone());
        s.lru.push_back(hash);
    }

    /// Install `node` under an additional pointer key, so lookups find it
    /// by either identity during a key update.
    pub fn hash_alias_insert(&self, node: &Arc<Node>, ptr: &PtrKey) {
        let hash = ptr_hash(ptr);
        let mut s = self.state.lock();
        s.table.insert(hash, node.clone());
    }

    pub fn hash_remove(&self, ptr: &PtrKey) {
        let hash = ptr_hash(ptr);
        let mut s = self.state.lock();
        s.table.remove(&hash);
        s.lru.retain(|h| *h != hash);
    }

    pub fn lookup(&self, ptr: &PtrKey) -> Option<Arc<Node>> {
        let hash = ptr_hash(ptr);
        let s = self.state.lock();
        let node = s.table.get(&hash).cloned();
        if let Some(n) = &node {
            n.flag_set(flags::ACCESSED);
        }
        node
    }

    /// Roots are never eviction candidates.
    pub fn lru_remove(&self, ptr: &PtrKey) {
        let hash = ptr_hash(ptr);
        let mut s = self.state.lock();
        s.lru.retain(|h| *h != hash);
    }

    /// Retire a descriptor whose on-disk node is gone.
    pub fn make_freeable(&self, node: &Arc<Node>) {
        let hash = ptr_hash(&node.data.lock().ptr);
        let mut s = self.state.lock();
        s.table.remove(&hash);
        s.lru.retain(|h| *h != hash);
        s.freeable.push(node.clone());
        trace!("cache: node {} freeable", node.nid);
    }

    pub fn is_freeable(&self, node: &Arc<Node>) -> bool {
        self.state
            .lock()
            .freeable
            .iter()
            .any(|n| n.nid == node.nid)
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::DiskPtr;
    use crate::lock::LockMode;

    fn ptr(off: u64) -> PtrKey {
        PtrKey::V1 {
            ptrs: vec![DiskPtr { dev: 0, offset: off }],
        }
    }

    #[test]
    fn lookup_by_either_key_during_alias_window() {
        let c = NodeCache::new(16);
        let n = c.mem_alloc(BtreeId(0), 0, ptr(0));
        n.flag_clear(flags::FAKE);
        n.lock.unlock(LockMode::Write);
        c.hash_insert(&n);

        let new = ptr(4096);
        c.hash_alias_insert(&n, &new);
        assert_eq!(c.lookup(&ptr(0)).unwrap().nid, n.nid);
        assert_eq!(c.lookup(&new).unwrap().nid, n.nid);

        c.hash_remove(&ptr(0));
        assert!(c.lookup(&ptr(0)).is_none());
        assert_eq!(c.lookup(&new).unwrap().nid, n.nid);
    }

    #[test]
    fn cannibalise_skips_dirty_nodes() {
        let c = NodeCache::new(2);
        let a = c.mem_alloc(BtreeId(0), 0, ptr(0));
        a.flag_clear(flags::FAKE);
        a.flag_set(flags::DIRTY);
        a.lock.unlock(LockMode::Write);
        c.hash_insert(&a);

        let b = c.mem_alloc(BtreeId(0), 0, ptr(64));
        b.flag_clear(flags::FAKE);
        b.lock.unlock(LockMode::Write);
        c.hash_insert(&b);

        let _g = c.cannibalize_lock();
        let d = c.mem_alloc(BtreeId(0), 0, ptr(128));
        d.lock.unlock(LockMode::Write);
        // The clean node went, the dirty one stayed.
        assert!(c.lookup(&ptr(64)).is_none());
        assert!(c.lookup(&ptr(0)).is_some());
    }
}
