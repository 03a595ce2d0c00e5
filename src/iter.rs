//! Btree paths: the slice of the iterator protocol the interior engine
//! consumes.
//!
//! A path holds one intent-locked node per level from the root down to the
//! target. Topology changes require intent locks up to the root so a split
//! can recurse into parents without lock-order inversions; after a change
//! the engine splices replacement nodes into the path and drops the ones it
//! freed.

use crate::{
    bkey::KeyPos,
    error::{Error, Result},
    fs::Filesystem,
    node::Node,
    BtreeId,
};
use log::trace;
use std::sync::Arc;

pub const MAX_DEPTH: usize = 4;

pub struct BtreePath {
    pub btree_id: BtreeId,
    nodes: [Option<Arc<Node>>; MAX_DEPTH],
}

impl BtreePath {
    /// Descend from the root to `level`, taking intent locks root-down.
    pub fn traverse_intent(
        fs: &Arc<Filesystem>,
        btree_id: BtreeId,
        pos: KeyPos,
        level: u8,
    ) -> Result<BtreePath> {
        let root = fs.roots.root_node(btree_id).ok_or(Error::Interrupted)?;
        root.lock.lock_intent();
        let mut path = BtreePath {
            btree_id,
            nodes: Default::default(),
        };
        let root_level = root.level as usize;
        assert!(root_level < MAX_DEPTH);
        path.nodes[root_level] = Some(root);

        let mut cur = root_level;
        while cur > level as usize {
            let child_key = {
                let node = path.nodes[cur].as_ref().unwrap();
                let data = node.data.lock();
                data.child_covering(pos).cloned()
            };
            let child_key = match child_key {
                Some(k) => k,
                None => {
                    path.unlock_all();
                    return Err(Error::Interrupted);
                }
            };
            let ptr = child_key.ptr().expect("interior keys are pointers");
            let child = fs.node_get(btree_id, (cur - 1) as u8, ptr)?;
            child.lock.lock_intent();
            cur -= 1;
            path.nodes[cur] = Some(child);
        }
        Ok(path)
    }

    pub fn node(&self, level: u8) -> Option<&Arc<Node>> {
        self.nodes[level as usize].as_ref()
    }

    pub fn has_parent(&self, level: u8) -> bool {
        (level as usize + 1) < MAX_DEPTH && self.nodes[level as usize + 1].is_some()
    }

    /// Splice a replacement node in at its level. The node is expected to
    /// already hold the lock mode the path tracks.
    pub fn set_node(&mut self, node: Arc<Node>) {
        let level = node.level as usize;
        trace!("path: level {} now node {}", level, node.nid);
        if let Some(old) = self.nodes[level].replace(node) {
            old.lock.unlock_intent();
        }
    }

    /// Drop a node from the path without replacement.
    pub fn drop_node(&mut self, level: u8) {
        if let Some(old) = self.nodes[level as usize].take() {
            old.lock.unlock_intent();
        }
    }

    pub fn unlock_all(&mut self) {
        for slot in self.nodes.iter_mut() {
            if let Some(node) = slot.take() {
                node.lock.unlock_intent();
            }
        }
    }

    /// Fetch and intent-lock the previous or next sibling of the node at
    /// `level`. Returns `None` at the edge of the tree.
    pub fn sibling(
        &self,
        fs: &Arc<Filesystem>,
        level: u8,
        next: bool,
    ) -> Result<Option<Arc<Node>>> {
        if level as usize + 1 >= MAX_DEPTH {
            return Ok(None);
        }
        let parent = match self.node(level + 1) {
            Some(p) => p,
            None => return Ok(None),
        };
        let child = self.node(level).expect("path holds target level");
        let child_pos = child.data.lock().max_key;
        let sib_key = {
            let data = parent.data.lock();
            let live: Vec<_> = data.keys.iter().filter(|k| k.is_live()).cloned().collect();
            let idx = live.iter().position(|k| k.pos == child_pos);
            match idx {
                Some(i) => {
                    if next {
                        live.get(i + 1).cloned()
                    } else if i > 0 {
                        live.get(i - 1).cloned()
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        let Some(sib_key) = sib_key else {
            return Ok(None);
        };
        let ptr = sib_key.ptr().expect("interior keys are pointers");
        let sib = fs.node_get(self.btree_id, level, ptr)?;
        sib.lock.lock_intent();
        Ok(Some(sib))
    }
}

impl Drop for BtreePath {
    fn drop(&mut self) {
        self.unlock_all();
    }
}
