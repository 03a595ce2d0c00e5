//! Node write engine and the in-memory device store.
//!
//! Writes are submitted per node and complete asynchronously; completion
//! feeds the reachability protocol. The background mode runs completions on
//! a worker thread the way a real block layer would; the inline mode runs
//! them on the issuing thread and exists for deterministic tests.

use crate::{
    fs::Filesystem,
    node::{flags, Node},
    update,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{trace, warn};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, thread::JoinHandle};

struct WriteReq {
    node: Arc<Node>,
}

pub struct IoEngine {
    /// sector -> image bytes, one map per device.
    devs: Vec<Mutex<HashMap<u64, Vec<u8>>>>,
    inline: bool,
    tx: Mutex<Option<Sender<WriteReq>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IoEngine {
    pub fn new(nr_devs: usize, inline: bool) -> Self {
        IoEngine {
            devs: (0..nr_devs).map(|_| Mutex::new(HashMap::new())).collect(),
            inline,
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background writer. No-op in inline mode.
    pub fn start(fs: &Arc<Filesystem>) {
        if fs.io.inline {
            return;
        }
        let (tx, rx): (Sender<WriteReq>, Receiver<WriteReq>) = unbounded();
        let fs2 = fs.clone();
        let handle = std::thread::Builder::new()
            .name("btree-node-write".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    perform_write(&fs2, req.node);
                }
            })
            .expect("spawn io worker");
        *fs.io.tx.lock() = Some(tx);
        *fs.io.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.tx.lock().take();
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
    }

    pub fn read_sector(&self, dev: u8, sector: u64) -> Option<Vec<u8>> {
        self.devs[dev as usize].lock().get(&sector).cloned()
    }
}

/// Write out a node if the ordering rules allow it right now.
///
/// The write is skipped, leaving the node dirty, while any update in the
/// node's write-blocked queue has children in flight, and while the node's
/// own data write is already placed but the node is still pending
/// reachability. Either condition re-arms: the blocked update's finalizer
/// reissues the write.
pub fn node_write(fs: &Arc<Filesystem>, node: &Arc<Node>) {
    if fs.interior_write_blocked(node.nid) {
        trace!("node {}: write deferred, blocked updates pending", node.nid);
        return;
    }
    if node.flag(flags::WRITE_IN_FLIGHT) {
        return;
    }
    if node.will_make_reachable().is_some() && node.flag(flags::DATA_WRITTEN) {
        trace!("node {}: write deferred until reachable", node.nid);
        return;
    }
    if !node.flag(flags::DIRTY) && node.flag(flags::DATA_WRITTEN) {
        return;
    }
    if fs.journal.error() && node.flag(flags::DATA_WRITTEN) {
        // Shed the dirty state without touching disk; recovery will see
        // the tree as it was.
        warn!("node {}: skipping write, journal error", node.nid);
        node.flag_clear(flags::DIRTY);
        return;
    }

    node.flag_set(flags::WRITE_IN_FLIGHT);
    node.flag_clear(flags::DIRTY);
    node.data.lock().write_started(&fs.journal);

    let queued = !fs.io.inline && {
        let tx = fs.io.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                tx.send(WriteReq { node: node.clone() }).expect("io worker");
                true
            }
            None => false,
        }
    };
    if !queued {
        perform_write(fs, node.clone());
    }
}

fn perform_write(fs: &Arc<Filesystem>, node: Arc<Node>) {
    let (bytes, ptrs) = {
        let data = node.data.lock();
        (data.pack(node.btree_id, node.level), data.ptr.ptrs().to_vec())
    };
    assert!(
        bytes.len() <= fs.config.btree_bytes(),
        "node image exceeds btree node size"
    );
    for ptr in &ptrs {
        fs.io.devs[ptr.dev as usize]
            .lock()
            .insert(ptr.offset, bytes.clone());
    }
    trace!(
        "node {}: wrote {} bytes to {:?}",
        node.nid,
        bytes.len(),
        ptrs
    );
    update::complete_write(fs, &node);
}
