//! Interior update transactions and the reachability protocol.
//!
//! Every topology change runs through one [UpdateTransaction]: it reserves
//! journal space, disk space and pre-allocated nodes up front, builds
//! replacement nodes that shadow the old ones, and defers the parent (or
//! root) mutation until every replacement is durable. A crash at any point
//! leaves the old tree fully intact: new nodes only become reachable once
//! the parent's journalled insert lands, and the journal pin held by the
//! update keeps every entry it depends on alive until then.
//!
//! The fan-in from "all my node writes completed" to "run the finalizer" is
//! a per-update reference count: one reference for the builder, one per
//! pending node write. The update is registered in an id table so node
//! descriptors can name their blocking update without a reference cycle.

use crate::{
    alloc::{DiskReservation, OpenBucket, ReserveClass},
    bkey::{DiskPtr, KeyList, NodeKey, PtrKey},
    error::{Error, Result},
    fs::Filesystem,
    io,
    journal::{JournalEntry, JournalPin, JournalPreres},
    lock::LockMode,
    node::{flags, Node},
    replicas::Trigger,
    BtreeId,
};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

pub mod interior;

pub type UpdateId = u64;

/// Don't drop transactional locks to wait for journal space; fail with
/// [Error::Interrupted] instead.
pub const NOUNLOCK: u32 = 1 << 0;
/// Allocate from the btree reserve.
pub const USE_RESERVE: u32 = 1 << 1;
/// Allocate from the reserve of last resort.
pub const USE_ALLOC_RESERVE: u32 = 1 << 2;
/// Running on behalf of journal reclaim; must never wait on the journal.
pub const JOURNAL_RECLAIM: u32 = 1 << 3;

/// Bound on the process-wide reserve cache of pre-allocated node regions.
const RESERVE_CACHE_SIZE: usize = 2 * crate::config::BTREE_NODE_RESERVE;

/// Journal space reserved per update, sized for the parent insertions and a
/// root entry with headroom for v2 pointer values.
fn journal_preres_u64s(nr_nodes: usize) -> u64 {
    ((nr_nodes as u64) * 2 + 1) * 16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    NoUpdate,
    UpdatingNode,
    UpdatingRoot,
    /// Reparented: the node this update targeted was freed; it now only
    /// contributes its journal pin to the update that freed it.
    UpdatingAs,
}

/// A pre-allocated on-disk region waiting for reuse.
pub struct ReservedRegion {
    pub ptr: PtrKey,
    pub open_buckets: Vec<OpenBucket>,
}

/// Shared half of an update, reachable from write completions, reparenting
/// and the finalizer.
pub struct UpdateShared {
    pub id: UpdateId,
    pub btree_id: BtreeId,
    refs: AtomicUsize,
    pub inner: Mutex<UpdateInner>,
}

pub struct UpdateInner {
    pub mode: UpdateMode,
    /// Parent node this update will mutate; `None` once reparented or for
    /// root updates.
    pub b: Option<Arc<Node>>,
    pub new_nodes: Vec<Arc<Node>>,
    pub open_buckets: Vec<OpenBucket>,
    /// Pointers deleted by this update.
    pub old_keys: KeyList,
    /// Pointers inserted by this update.
    pub new_keys: KeyList,
    pub journal_entries: Vec<JournalEntry>,
    pub journal_pin: JournalPin,
    pub journal_preres: Option<JournalPreres>,
    pub disk_res: Option<DiskReservation>,
    pub nodes_written: bool,
    done: bool,
}

/// Process-wide interior-update state, one mutex.
pub struct InteriorState {
    pub updates: HashMap<UpdateId, Arc<UpdateShared>>,
    /// Updates in [UpdateMode::UpdatingRoot], not yet finalized.
    pub unwritten: Vec<UpdateId>,
    /// Per-node queues of updates blocking that node's next write.
    pub write_blocked: HashMap<u64, Vec<UpdateId>>,
    pub reserve_cache: VecDeque<ReservedRegion>,
    next_id: UpdateId,
}

pub struct InteriorUpdates {
    pub state: Mutex<InteriorState>,
    pub quiesce: Condvar,
    pub finalize_tx: Mutex<Option<crossbeam_channel::Sender<UpdateId>>>,
    pub worker: Mutex<Option<JoinHandle<()>>>,
}

impl InteriorUpdates {
    pub fn new() -> Self {
        InteriorUpdates {
            state: Mutex::new(InteriorState {
                updates: HashMap::new(),
                unwritten: Vec::new(),
                write_blocked: HashMap::new(),
                reserve_cache: VecDeque::new(),
                next_id: 1,
            }),
            quiesce: Condvar::new(),
            finalize_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the finalizer worker.
    pub fn start(fs: &Arc<Filesystem>) {
        let (tx, rx) = crossbeam_channel::unbounded::<UpdateId>();
        let fs2 = fs.clone();
        let handle = std::thread::Builder::new()
            .name("btree-update-finalize".into())
            .spawn(move || {
                while let Ok(id) = rx.recv() {
                    finalize(&fs2, id);
                }
            })
            .expect("spawn finalizer");
        *fs.interior.finalize_tx.lock() = Some(tx);
        *fs.interior.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.finalize_tx.lock().take();
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
    }

    /// Block until no update is registered.
    pub fn wait_quiesce(&self) {
        let mut s = self.state.lock();
        while !s.updates.is_empty() {
            self.quiesce.wait(&mut s);
        }
    }

    /// Drain the reserve cache, releasing held regions.
    pub fn drain_reserve(&self, fs: &Filesystem) {
        let regions: Vec<ReservedRegion> = self.state.lock().reserve_cache.drain(..).collect();
        for r in regions {
            for ptr in r.ptr.ptrs() {
                fs.alloc.release_sectors(*ptr, fs.config.btree_node_sectors);
            }
            fs.alloc.open_buckets_put(r.open_buckets);
        }
    }
}

impl Default for InteriorUpdates {
    fn default() -> Self {
        InteriorUpdates::new()
    }
}

/// Caller-side handle on one topology change.
pub struct UpdateTransaction {
    pub fs: Arc<Filesystem>,
    pub shared: Arc<UpdateShared>,
    /// Reserved nodes, each locked intent+write.
    pub prealloc: Vec<Arc<Node>>,
    pub flags: u32,
}

/// Start an update: journal health check, id allocation, journal preres,
/// disk reservation, node reserve — releasing everything acquired so far on
/// any failure.
pub fn start(
    fs: &Arc<Filesystem>,
    btree_id: BtreeId,
    nr_nodes: usize,
    upd_flags: u32,
) -> Result<UpdateTransaction> {
    if fs.journal.error() {
        return Err(Error::JournalError);
    }

    let shared = {
        let mut s = fs.interior.state.lock();
        let id = s.next_id;
        s.next_id += 1;
        // Worst case over the topology operations: one delete and up to
        // two inserts per reserved node, plus one key outside the reserve
        // (a key update on a node that needs no replacement).
        let keylist_cap = nr_nodes * 2 + 1;
        let shared = Arc::new(UpdateShared {
            id,
            btree_id,
            refs: AtomicUsize::new(1),
            inner: Mutex::new(UpdateInner {
                mode: UpdateMode::NoUpdate,
                b: None,
                new_nodes: Vec::new(),
                open_buckets: Vec::new(),
                old_keys: KeyList::with_capacity(keylist_cap),
                new_keys: KeyList::with_capacity(keylist_cap),
                journal_entries: Vec::new(),
                journal_pin: JournalPin::default(),
                journal_preres: None,
                disk_res: None,
                nodes_written: false,
                done: false,
            }),
        });
        s.updates.insert(id, shared.clone());
        shared
    };

    let mut update = UpdateTransaction {
        fs: fs.clone(),
        shared,
        prealloc: Vec::new(),
        flags: upd_flags,
    };

    let nonblock = upd_flags & (NOUNLOCK | JOURNAL_RECLAIM) != 0;
    let preres = match fs.journal.preres_get(journal_preres_u64s(nr_nodes), true) {
        Ok(p) => p,
        Err(Error::WouldBlock) if !nonblock => {
            // Caller allowed us to drop its locks and wait for space.
            match fs.journal.preres_get(journal_preres_u64s(nr_nodes), false) {
                Ok(p) => p,
                Err(e) => {
                    abort(fs, &update.shared);
                    return Err(e);
                }
            }
        }
        Err(Error::WouldBlock) => {
            abort(fs, &update.shared);
            return Err(Error::Interrupted);
        }
        Err(e) => {
            abort(fs, &update.shared);
            return Err(e);
        }
    };
    let pin = fs.journal.pin_add(fs.journal.cur_seq());
    {
        let mut inner = update.shared.inner.lock();
        inner.journal_preres = Some(preres);
        inner.journal_pin = pin;
    }

    let sectors =
        nr_nodes as u64 * fs.config.btree_node_sectors as u64 * fs.config.metadata_replicas as u64;
    match fs.alloc.disk_reservation_get(sectors, nonblock) {
        Ok(res) => update.shared.inner.lock().disk_res = Some(res),
        Err(e) => {
            abort(fs, &update.shared);
            return Err(if matches!(e, Error::WouldBlock) && nonblock {
                Error::Interrupted
            } else {
                e
            });
        }
    }

    if let Err(e) = reserve_get(fs, &mut update, nr_nodes) {
        reserve_put(fs, &mut update);
        abort(fs, &update.shared);
        return Err(e);
    }

    trace!(
        "update {}: started, {} nodes reserved",
        update.shared.id,
        nr_nodes
    );
    Ok(update)
}

/// Tear down an update that failed during `start`, releasing in reverse
/// order of acquisition.
fn abort(fs: &Arc<Filesystem>, shared: &Arc<UpdateShared>) {
    {
        let mut inner = shared.inner.lock();
        assert_eq!(inner.mode, UpdateMode::NoUpdate);
        if let Some(p) = inner.journal_preres.take() {
            fs.journal.preres_put(p);
        }
        let mut pin = std::mem::take(&mut inner.journal_pin);
        fs.journal.pin_drop(&mut pin);
        if let Some(r) = inner.disk_res.take() {
            fs.alloc.disk_reservation_put(r);
        }
    }
    let mut s = fs.interior.state.lock();
    s.updates.remove(&shared.id);
    drop(s);
    fs.interior.quiesce.notify_all();
}

/// Guarantee `update.prealloc` holds at least `nr` nodes, each with disk
/// space allocated and pointer key initialized, held under write lock.
pub fn reserve_get(fs: &Arc<Filesystem>, update: &mut UpdateTransaction, nr: usize) -> Result<()> {
    let reserve = if update.flags & USE_ALLOC_RESERVE != 0 {
        ReserveClass::Alloc
    } else if update.flags & USE_RESERVE != 0 {
        ReserveClass::Btree
    } else {
        ReserveClass::None
    };
    let nowait = update.flags & (NOUNLOCK | JOURNAL_RECLAIM) != 0;

    let _cannibalize = fs.cache.cannibalize_lock();
    while update.prealloc.len() < nr {
        let region = {
            let mut s = fs.interior.state.lock();
            s.reserve_cache.pop_front()
        };
        let region = match region {
            Some(r) => r,
            None => {
                let (ptrs, obs) = fs.alloc.alloc_sectors(
                    fs.config.btree_node_sectors,
                    fs.config.metadata_replicas as usize,
                    reserve,
                    nowait,
                )?;
                ReservedRegion {
                    ptr: make_ptr_key(fs, &ptrs),
                    open_buckets: obs,
                }
            }
        };
        let node = fs
            .cache
            .mem_alloc(update.shared.btree_id, 0, region.ptr.clone());
        {
            let mut data = node.data.lock();
            data.open_buckets = region.open_buckets;
        }
        update.prealloc.push(node);
    }
    Ok(())
}

fn make_ptr_key(fs: &Filesystem, ptrs: &[DiskPtr]) -> PtrKey {
    if fs.config.ptr_v2 {
        PtrKey::V2 {
            ptrs: ptrs.to_vec(),
            min_key: crate::bkey::KeyPos::MIN,
            seq: fs.next_node_seq(),
            sectors_written: 0,
            sectors: fs.config.btree_node_sectors,
        }
    } else {
        PtrKey::V1 {
            ptrs: ptrs.to_vec(),
        }
    }
}

/// Return still-unused reserved nodes: back into the reserve cache while it
/// has room, otherwise released outright. Descriptors go to the freeable
/// list either way.
pub fn reserve_put(fs: &Arc<Filesystem>, update: &mut UpdateTransaction) {
    while let Some(node) = update.prealloc.pop() {
        let region = {
            let mut data = node.data.lock();
            ReservedRegion {
                ptr: data.ptr.clone(),
                open_buckets: std::mem::take(&mut data.open_buckets),
            }
        };
        let spilled = {
            let mut s = fs.interior.state.lock();
            if s.reserve_cache.len() < RESERVE_CACHE_SIZE {
                s.reserve_cache.push_back(region);
                None
            } else {
                Some(region)
            }
        };
        if let Some(region) = spilled {
            for p in region.ptr.ptrs() {
                fs.alloc.release_sectors(*p, fs.config.btree_node_sectors);
            }
            fs.alloc.open_buckets_put(region.open_buckets);
        }
        fs.cache.make_freeable(&node);
        node.lock.unlock(LockMode::Write);
    }
}

impl UpdateTransaction {
    pub fn id(&self) -> UpdateId {
        self.shared.id
    }

    /// Take one reserved node and shape it for use at `level` covering
    /// `[min_key, max_key]`.
    pub fn take_prealloc(&mut self, level: u8) -> Arc<Node> {
        let node = self.prealloc.pop().expect("node reserve underflow");
        // Level is part of the descriptor identity; reserved descriptors
        // are allocated at leaf level and retagged here.
        let node = if node.level == level {
            node
        } else {
            let retagged = Arc::new(Node::new(
                node.nid,
                node.btree_id,
                level,
                node.data.lock().ptr.clone(),
            ));
            retagged.flag_set(flags::FAKE);
            retagged.lock.lock_intent();
            retagged.lock.lock_write();
            {
                let mut to = retagged.data.lock();
                let mut from = node.data.lock();
                to.open_buckets = std::mem::take(&mut from.open_buckets);
            }
            node.lock.unlock(LockMode::Write);
            retagged
        };
        node
    }

    /// Register `node` as published by this update. Its write may place
    /// data, but the node stays unreachable until this update commits.
    pub fn add_new_node(&self, node: &Arc<Node>) {
        assert!(node.set_will_make_reachable(self.shared.id));
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        let key = node.data.lock().node_key();
        let mut inner = self.shared.inner.lock();
        inner.new_nodes.push(node.clone());
        drop(inner);
        self.add_new_key(key);
    }

    /// Register a pointer this update introduces, for replica marking and
    /// the insert trigger at commit.
    pub fn add_new_key(&self, key: NodeKey) {
        if let Some(ptr) = key.ptr() {
            self.fs.replicas.mark_bkey_replicas(ptr);
        }
        self.shared.inner.lock().new_keys.push(key);
    }

    /// Transfer the node's allocator reservations to the update, so they
    /// are only released when the update has truly committed.
    pub fn take_open_buckets(&self, node: &Arc<Node>) {
        let obs = std::mem::take(&mut node.data.lock().open_buckets);
        self.shared.inner.lock().open_buckets.extend(obs);
    }

    /// `NoUpdate -> UpdatingNode`: this update will insert into `b`, whose
    /// next write is deferred until our new nodes are durable.
    pub fn updated_node(&self, b: &Arc<Node>) {
        let mut inner = self.shared.inner.lock();
        assert_eq!(inner.mode, UpdateMode::NoUpdate);
        inner.mode = UpdateMode::UpdatingNode;
        inner.b = Some(b.clone());
        drop(inner);
        let mut s = self.fs.interior.state.lock();
        s.write_blocked.entry(b.nid).or_default().push(self.shared.id);
        debug!("update {}: blocking writes of node {}", self.shared.id, b.nid);
    }

    /// `NoUpdate -> UpdatingRoot`: this update installs a new root.
    pub fn updated_root(&self, root: &Arc<Node>) {
        let entry = {
            let data = root.data.lock();
            JournalEntry::BtreeRoot {
                btree_id: root.btree_id,
                level: root.level,
                key: data.node_key(),
            }
        };
        let mut inner = self.shared.inner.lock();
        assert_eq!(inner.mode, UpdateMode::NoUpdate);
        inner.mode = UpdateMode::UpdatingRoot;
        inner.journal_entries.push(entry);
        drop(inner);
        let mut s = self.fs.interior.state.lock();
        s.unwritten.push(self.shared.id);
    }

    /// Queue the deletion of an existing pointer.
    pub fn delete_key(&self, key: NodeKey) {
        self.shared.inner.lock().old_keys.push(key);
    }

    /// Journal the insertion of a pointer at `level`. Marking of new node
    /// pointers happens via [UpdateTransaction::add_new_node]; this only
    /// records the parent-side mutation for recovery.
    pub fn insert_key_at(&self, level: u8, key: NodeKey) {
        let mut inner = self.shared.inner.lock();
        let entry = JournalEntry::BtreeKeys {
            btree_id: self.shared.btree_id,
            level,
            key,
        };
        inner.journal_entries.push(entry);
    }

    /// Journal a whiteout at `level`.
    pub fn journal_whiteout_at(&self, level: u8, pos: crate::bkey::KeyPos) {
        let mut inner = self.shared.inner.lock();
        let entry = JournalEntry::BtreeKeys {
            btree_id: self.shared.btree_id,
            level,
            key: NodeKey::whiteout(pos),
        };
        inner.journal_entries.push(entry);
    }

    /// The update is fully built: return unused reserve and let the
    /// finalizer run once every node write has completed.
    pub fn done(mut self) {
        let fs = self.fs.clone();
        reserve_put(&fs, &mut self);
        {
            let mut inner = self.shared.inner.lock();
            assert_ne!(
                inner.mode,
                UpdateMode::NoUpdate,
                "update finished without a target"
            );
            inner.done = true;
        }
        closure_put(&fs, &self.shared);
    }
}

/// Drop one reference; at zero the update's nodes are all written and the
/// finalizer takes over.
pub fn closure_put(fs: &Arc<Filesystem>, shared: &Arc<UpdateShared>) {
    if shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.inner.lock().nodes_written = true;
        let queued = {
            let tx = fs.interior.finalize_tx.lock();
            match tx.as_ref() {
                Some(tx) => {
                    let _ = tx.send(shared.id);
                    true
                }
                None => false,
            }
        };
        // Mount/unmount windows run the finalizer synchronously.
        if !queued {
            finalize(fs, shared.id);
        }
    }
}

/// Node-write completion: the node's data is durable. Clears the pending
/// reachability mark and releases that reference on the blocking update.
pub fn complete_write(fs: &Arc<Filesystem>, node: &Arc<Node>) {
    node.flag_set(flags::DATA_WRITTEN);
    node.flag_clear(flags::WRITE_IN_FLIGHT);
    node.data.lock().write_done(&fs.journal);
    if let Some(id) = node.take_will_make_reachable() {
        let shared = fs.interior.state.lock().updates.get(&id).cloned();
        if let Some(shared) = shared {
            trace!("node {}: durable, unblocking update {}", node.nid, id);
            closure_put(fs, &shared);
        }
    }
}

/// The finalizer: journals the update's entries, marks replicas, unblocks
/// and redirties the parent, then sheds every resource.
fn finalize(fs: &Arc<Filesystem>, id: UpdateId) {
    let Some(shared) = fs.interior.state.lock().updates.get(&id).cloned() else {
        return;
    };

    let mut inner = shared.inner.lock();
    assert!(inner.nodes_written && inner.done);
    let journal_err = fs.journal.error();

    // The inner transaction: journal the parent insert / root entry and
    // run the marking triggers. It runs with our own preres and never
    // waits on the journal, so reclaim can depend on this path completing.
    let mut seq = 0;
    if !journal_err {
        let entries = std::mem::take(&mut inner.journal_entries);
        let preres = inner.journal_preres.as_mut().expect("preres held");
        seq = fs.journal.entries_add(preres, &entries);
        let node_sectors = fs.config.btree_node_sectors;
        for key in inner.new_keys.iter() {
            fs.replicas.trans_mark_key(key, node_sectors, Trigger::Insert);
        }
        for key in inner.old_keys.iter() {
            fs.replicas.trans_mark_key(key, node_sectors, Trigger::Overwrite);
            if let Some(ptr) = key.ptr() {
                for p in ptr.ptrs() {
                    fs.alloc.release_sectors(*p, node_sectors);
                }
            }
        }
    } else {
        warn!("update {}: journal error, shedding resources only", id);
    }

    let mode = inner.mode;
    let b = inner.b.take();
    match mode {
        UpdateMode::NoUpdate => unreachable!("finalizing an empty update"),
        UpdateMode::UpdatingNode => {
            let b = b.expect("UpdatingNode has a parent");
            drop(inner);
            b.lock.lock_intent();
            b.lock.lock_write();
            {
                let mut s = fs.interior.state.lock();
                if let Some(q) = s.write_blocked.get_mut(&b.nid) {
                    q.retain(|u| *u != id);
                    if q.is_empty() {
                        s.write_blocked.remove(&b.nid);
                    }
                }
            }
            {
                let mut data = b.data.lock();
                data.journal_seq_advance(seq);
                if !journal_err {
                    data.pin_dirty(&fs.journal, seq);
                }
            }
            b.lock.unlock_write();
            if !journal_err {
                io::node_write(fs, &b);
            }
            b.lock.unlock_intent();
            inner = shared.inner.lock();
        }
        UpdateMode::UpdatingRoot => {
            let mut s = fs.interior.state.lock();
            s.unwritten.retain(|u| *u != id);
        }
        UpdateMode::UpdatingAs => {
            // The update that freed our target carries our pin from here.
        }
    }

    // The parent's journal seq now enforces ordering; our pin has done its
    // job.
    let mut pin = std::mem::take(&mut inner.journal_pin);
    fs.journal.pin_drop(&mut pin);
    if let Some(p) = inner.journal_preres.take() {
        fs.journal.preres_put(p);
    }
    if let Some(mut r) = inner.disk_res.take() {
        // The published nodes' sectors are in use now; only the unused
        // remainder returns to the pool.
        let consumed = inner.new_nodes.len() as u64
            * fs.config.btree_node_sectors as u64
            * fs.config.metadata_replicas as u64;
        r.sectors = r.sectors.saturating_sub(consumed);
        fs.alloc.disk_reservation_put(r);
    }
    let obs = std::mem::take(&mut inner.open_buckets);
    fs.alloc.open_buckets_put(obs);
    inner.new_nodes.clear();
    let (nr_new, nr_old) = (inner.new_keys.len(), inner.old_keys.len());
    drop(inner);

    {
        let mut s = fs.interior.state.lock();
        s.updates.remove(&id);
    }
    fs.interior.quiesce.notify_all();
    debug!(
        "update {}: complete ({} inserts, {} deletes)",
        id, nr_new, nr_old
    );
}

/// Prepare to free node `b` while updates may still depend on its next
/// write: reparent each dependent update onto `update`, transfer `b`'s
/// journal pins, and queue the pointer delete.
///
/// The caller holds `b` locked intent+write.
pub fn will_free_node(update: &UpdateTransaction, b: &Arc<Node>) {
    let fs = &update.fs;
    b.flag_set(flags::DYING);

    let dependents: Vec<Arc<UpdateShared>> = {
        let mut s = fs.interior.state.lock();
        let ids = s.write_blocked.remove(&b.nid).unwrap_or_default();
        ids.iter()
            .filter_map(|id| s.updates.get(id).cloned())
            .collect()
    };
    for child in dependents {
        reparent(fs, &update.shared, &child);
    }

    {
        let mut parent_inner = update.shared.inner.lock();
        let mut data = b.data.lock();
        for i in 0..2 {
            let mut node_pin = std::mem::take(&mut data.journal_pins[i]);
            fs.journal.pin_copy(&mut parent_inner.journal_pin, &node_pin);
            fs.journal.pin_drop(&mut node_pin);
        }
    }
    b.flag_clear(flags::DIRTY);

    // If b was itself about to be published by another update, that update
    // no longer owes a write for it.
    if let Some(other_id) = b.take_will_make_reachable() {
        let other = fs.interior.state.lock().updates.get(&other_id).cloned();
        if let Some(other) = other {
            other.inner.lock().new_nodes.retain(|n| n.nid != b.nid);
            closure_put(fs, &other);
        }
    }

    let key = b.data.lock().node_key();
    update.delete_key(key);
}

/// `{UpdatingNode|UpdatingRoot} -> UpdatingAs`: the node `child` targeted
/// is going away; `parent` (the update freeing it) inherits the pin.
fn reparent(fs: &Arc<Filesystem>, parent: &Arc<UpdateShared>, child: &Arc<UpdateShared>) {
    assert_ne!(parent.id, child.id);
    let mut child_inner = child.inner.lock();
    assert_eq!(child_inner.mode, UpdateMode::UpdatingNode);
    let mut parent_inner = parent.inner.lock();
    fs.journal
        .pin_copy(&mut parent_inner.journal_pin, &child_inner.journal_pin);
    drop(parent_inner);
    let mut pin = std::mem::take(&mut child_inner.journal_pin);
    fs.journal.pin_drop(&mut pin);
    child_inner.b = None;
    child_inner.mode = UpdateMode::UpdatingAs;
    debug!("update {}: reparented onto {}", child.id, parent.id);
}
