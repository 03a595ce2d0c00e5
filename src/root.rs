//! The root registry: per-btree-id pointer to the current root.
//!
//! Every journal commit embeds a complete snapshot of this registry, so
//! recovery from any sealed entry sees every root. In memory a root holds
//! its node descriptor; after recovery only the key is known until the node
//! is faulted in.

use crate::{
    bkey::NodeKey,
    cache::NodeCache,
    journal::JournalEntry,
    node::{flags, Node},
    BtreeId,
};
use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

pub struct BtreeRoot {
    pub node: Option<Arc<Node>>,
    pub level: u8,
    pub key: NodeKey,
}

#[derive(Default)]
pub struct RootRegistry {
    roots: Mutex<HashMap<BtreeId, BtreeRoot>>,
}

impl RootRegistry {
    /// Publish `node` as the root of its btree. Roots are exempt from
    /// cache eviction. The tree never shrinks by replacing a root with a
    /// lower-level node unless the old root is dying.
    pub fn set_root_inmem(&self, cache: &NodeCache, node: &Arc<Node>) {
        let key = {
            let data = node.data.lock();
            cache.lru_remove(&data.ptr);
            data.node_key()
        };
        node.flag_set(flags::NOEVICT);
        let mut roots = self.roots.lock();
        if let Some(old) = roots.get(&node.btree_id) {
            let old_dying = old
                .node
                .as_ref()
                .map(|n| n.flag(flags::DYING))
                .unwrap_or(true);
            assert!(
                node.level >= old.level || old_dying,
                "root of btree {:?} would shrink from level {} to {}",
                node.btree_id,
                old.level,
                node.level
            );
        }
        debug!(
            "btree {:?}: root now node {} at level {}",
            node.btree_id, node.nid, node.level
        );
        roots.insert(
            node.btree_id,
            BtreeRoot {
                node: Some(node.clone()),
                level: node.level,
                key,
            },
        );
    }

    /// Refresh the stored key of an existing root after a key update.
    pub fn update_root_key(&self, btree_id: BtreeId, key: NodeKey) {
        let mut roots = self.roots.lock();
        let root = roots.get_mut(&btree_id).expect("known root");
        root.key = key;
    }

    pub fn root_node(&self, btree_id: BtreeId) -> Option<Arc<Node>> {
        self.roots.lock().get(&btree_id).and_then(|r| r.node.clone())
    }

    pub fn root_key(&self, btree_id: BtreeId) -> Option<NodeKey> {
        self.roots.lock().get(&btree_id).map(|r| r.key.clone())
    }

    /// Snapshot of every root as journal entries, in btree-id order.
    pub fn roots_to_journal_entries(&self) -> Vec<JournalEntry> {
        let roots = self.roots.lock();
        roots
            .keys()
            .copied()
            .sorted_by_key(|id| id.0)
            .map(|id| {
                let r = &roots[&id];
                JournalEntry::BtreeRoot {
                    btree_id: id,
                    level: r.level,
                    key: r.key.clone(),
                }
            })
            .collect()
    }

    /// Rebuild the registry from journal entries; later entries win. Nodes
    /// are left unresolved for the caller to fault in.
    pub fn journal_entries_to_roots(&self, entries: &[JournalEntry]) {
        let mut roots = self.roots.lock();
        for e in entries {
            if let JournalEntry::BtreeRoot {
                btree_id,
                level,
                key,
            } = e
            {
                roots.insert(
                    *btree_id,
                    BtreeRoot {
                        node: None,
                        level: *level,
                        key: key.clone(),
                    },
                );
            }
        }
    }

    pub fn nr_roots(&self) -> usize {
        self.roots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{DiskPtr, KeyPos, PtrKey};

    fn registry_with_roots(n: u32) -> RootRegistry {
        let reg = RootRegistry::default();
        let mut roots = reg.roots.lock();
        for i in 0..n {
            roots.insert(
                BtreeId(i),
                BtreeRoot {
                    node: None,
                    level: 1,
                    key: NodeKey::new_ptr(
                        KeyPos::MAX,
                        PtrKey::V1 {
                            ptrs: vec![DiskPtr {
                                dev: 0,
                                offset: i as u64 * 64,
                            }],
                        },
                    ),
                },
            );
        }
        drop(roots);
        reg
    }

    #[test]
    fn snapshot_roundtrip_is_idempotent() {
        let reg = registry_with_roots(3);
        let snap = reg.roots_to_journal_entries();

        let other = RootRegistry::default();
        other.journal_entries_to_roots(&snap);
        assert_eq!(other.roots_to_journal_entries(), snap);

        // A second pass through the boundary changes nothing.
        other.journal_entries_to_roots(&snap);
        assert_eq!(other.roots_to_journal_entries(), snap);
    }

    #[test]
    fn later_entries_win() {
        let reg = registry_with_roots(1);
        let mut snap = reg.roots_to_journal_entries();
        let newer = JournalEntry::BtreeRoot {
            btree_id: BtreeId(0),
            level: 2,
            key: NodeKey::new_ptr(
                KeyPos::MAX,
                PtrKey::V1 {
                    ptrs: vec![DiskPtr { dev: 0, offset: 640 }],
                },
            ),
        };
        snap.push(newer.clone());
        let other = RootRegistry::default();
        other.journal_entries_to_roots(&snap);
        assert_eq!(other.roots_to_journal_entries(), vec![newer]);
    }
}
