//! The topology operations: split, merge, rewrite, key update.
//!
//! All four build replacement nodes through one update transaction and
//! publish them through [insert_node] (parent insertion, recursing into a
//! parent split when the parent is full) or through the root registry. The
//! caller's path must hold intent locks up to the root.

use super::{will_free_node, UpdateTransaction};
use crate::{
    bkey::{FormatBuilder, KeyFormat, KeyList, KeyPos, NodeKey, PtrKey},
    cache::ptr_hash,
    error::Result,
    fs::Filesystem,
    io,
    iter::BtreePath,
    node::{flags, Node},
    update, BtreeId,
};
use log::{debug, trace};
use std::sync::Arc;

/// Numerator/denominator of the pivot position within a split node's key
/// payload.
const SPLIT_FRACTION: (usize, usize) = (3, 5);

/// Sibling side for a foreground merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Prev = 0,
    Next = 1,
}

/// Choose the narrowest format the node's live keys (plus its `min_key`)
/// fit in; keep the source format when repacking would overflow the node.
pub fn plan_replacement_format(config: &crate::config::Config, node: &Arc<Node>) -> KeyFormat {
    let data = node.data.lock();
    let mut b = FormatBuilder::new();
    b.add_pos(data.min_key);
    for k in data.keys.iter().filter(|k| k.is_live()) {
        b.add_key(k);
    }
    let candidate = b.build();
    let repacked = crate::bkey::format::repacked_u64s(
        data.live_u64s,
        &data.format,
        &candidate,
        data.nr_packed,
        data.nr_unpacked,
    );
    if repacked > config.btree_node_u64s() as isize {
        trace!(
            "node {}: repack would overflow ({} u64s), keeping source format",
            node.nid,
            repacked
        );
        data.format
    } else {
        candidate
    }
}

fn shape_node(
    node: &Arc<Node>,
    min_key: KeyPos,
    max_key: KeyPos,
    format: KeyFormat,
    seq: u64,
    keys: Vec<NodeKey>,
) {
    let mut data = node.data.lock();
    data.min_key = min_key;
    data.max_key = max_key;
    data.format = format;
    data.seq = seq;
    data.keys = keys;
    if let PtrKey::V2 {
        min_key: ptr_min,
        seq: ptr_seq,
        ..
    } = &mut data.ptr
    {
        *ptr_min = min_key;
        *ptr_seq = seq;
    }
    data.recount();
    drop(data);
    node.flag_clear(flags::FAKE);
    node.flag_set(flags::DIRTY);
}

/// Allocate a replacement for `b`: same range and keys, fresh location,
/// replanned format.
pub fn alloc_replacement(update: &mut UpdateTransaction, b: &Arc<Node>) -> Arc<Node> {
    let format = plan_replacement_format(&update.fs.config, b);
    let n = update.take_prealloc(b.level);
    let (min, max, seq, keys) = {
        let data = b.data.lock();
        (
            data.min_key,
            data.max_key,
            data.seq + 1,
            data.keys.iter().filter(|k| k.is_live()).cloned().collect(),
        )
    };
    shape_node(&n, min, max, format, seq, keys);
    n
}

fn alloc_empty(
    update: &mut UpdateTransaction,
    level: u8,
    min_key: KeyPos,
    max_key: KeyPos,
    format: KeyFormat,
    seq: u64,
) -> Arc<Node> {
    let n = update.take_prealloc(level);
    shape_node(&n, min_key, max_key, format, seq, Vec::new());
    n
}

/// Dispatch the data-placing write of a freshly built node and drop its
/// write lock; intent is retained by the caller.
fn issue_write(update: &UpdateTransaction, node: &Arc<Node>) {
    update.add_new_node(node);
    update.take_open_buckets(node);
    node.lock.unlock_write();
    io::node_write(&update.fs, node);
}

/// Whether `keys` fit into `b` without a split.
fn keys_fit(fs: &Filesystem, b: &Arc<Node>, keys: &KeyList) -> bool {
    let data = b.data.lock();
    let add: usize = keys
        .iter()
        .filter(|k| k.is_live())
        .map(|k| k.u64s_in(&data.format))
        .sum();
    data.live_u64s + add <= fs.config.btree_node_u64s()
}

/// Insert pointer keys into the interior node at `level` of the path,
/// splitting it when it is full or scheduled for rewrite.
pub fn insert_node(
    update: &mut UpdateTransaction,
    path: &mut BtreePath,
    level: u8,
    keys: KeyList,
) -> Result<()> {
    assert!(level > 0, "interior insert below level 1");
    let b = path.node(level).expect("path holds insert level").clone();
    assert_eq!(b.level, level);

    if b.flag(flags::NEED_REWRITE) || !keys_fit(&update.fs, &b, &keys) {
        debug!(
            "node {}: insert takes the split path (need_rewrite={})",
            b.nid,
            b.flag(flags::NEED_REWRITE)
        );
        return split(update, path, &b, keys);
    }

    b.lock.lock_write();
    {
        let mut data = b.data.lock();
        for key in keys.iter() {
            data.apply_key(key.clone());
        }
    }
    b.flag_set(flags::DIRTY);
    b.lock.unlock_write();

    for key in keys.iter() {
        if key.is_live() {
            update.insert_key_at(level, key.clone());
        } else {
            update.journal_whiteout_at(level, key.pos);
        }
    }
    update.updated_node(&b);
    Ok(())
}

/// Replace `b` with one or two new nodes, growing the tree by a level when
/// `b` was the root and had to split. `fixup` keys are inserted before the
/// pivot is chosen so the insert that triggered the split lands atomically
/// with it.
pub fn split(
    update: &mut UpdateTransaction,
    path: &mut BtreePath,
    b: &Arc<Node>,
    fixup: KeyList,
) -> Result<()> {
    let fs = update.fs.clone();
    let level = b.level;

    b.lock.lock_write();
    will_free_node(update, b);

    let n1 = alloc_replacement(update, b);
    {
        let mut data = n1.data.lock();
        for key in fixup.iter() {
            data.apply_key(key.clone());
        }
    }
    // The fix-up keys ride in the replacement node's write, but they are
    // still journalled and marked: recovery replays them by position, and
    // the accounting has to see the insert.
    for key in fixup.iter() {
        if key.is_live() {
            update.insert_key_at(level, key.clone());
        } else {
            update.journal_whiteout_at(level, key.pos);
        }
    }
    let (split_two, n2) = {
        let live_u64s = n1.data.lock().live_u64s;
        if live_u64s > fs.config.split_threshold() {
            let n2 = split_keys(update, &n1);
            (true, Some(n2))
        } else {
            (false, None)
        }
    };

    let has_parent = path.has_parent(level);
    let n3 = if split_two && !has_parent {
        // Root split: grow the tree by one level.
        let n2 = n2.as_ref().unwrap();
        let seq = n1.data.lock().seq;
        let n3 = alloc_empty(
            update,
            level + 1,
            KeyPos::MIN,
            KeyPos::MAX,
            KeyFormat::full(),
            seq,
        );
        {
            let mut data = n3.data.lock();
            data.apply_key(n1.data.lock().node_key());
            data.apply_key(n2.data.lock().node_key());
        }
        Some(n3)
    } else {
        None
    };

    // Writes are issued newest-range-first; ordering is not semantic, both
    // are pinned against reachability until the update commits.
    if let Some(n2) = &n2 {
        issue_write(update, n2);
    }
    issue_write(update, &n1);
    if let Some(n3) = &n3 {
        issue_write(update, n3);
    }

    // Publish.
    if has_parent {
        let mut parent_keys = KeyList::with_capacity(2);
        parent_keys.push(n1.data.lock().node_key());
        if let Some(n2) = &n2 {
            parent_keys.push(n2.data.lock().node_key());
        }
        insert_node(update, path, level + 1, parent_keys)?;
    } else if let Some(n3) = &n3 {
        set_root(update, n3);
    } else {
        set_root(update, &n1);
    }

    // Splice the replacements into the path and drop the freed node.
    b.lock.unlock_write();
    fs.cache.make_freeable(b);
    path.set_node(n1.clone());
    fs.cache.hash_insert(&n1);
    if let Some(n2) = &n2 {
        fs.cache.hash_insert(n2);
        n2.lock.unlock_intent();
    }
    if let Some(n3) = &n3 {
        fs.cache.hash_insert(n3);
        path.set_node(n3.clone());
    }
    Ok(())
}

/// Move the upper part of `n1`'s key set into a fresh right sibling.
fn split_keys(update: &mut UpdateTransaction, n1: &Arc<Node>) -> Arc<Node> {
    let (pivot, old_max, format, seq, upper) = {
        let mut data = n1.data.lock();
        let total = data.live_u64s;
        let target = total * SPLIT_FRACTION.0 / SPLIT_FRACTION.1;
        let mut acc = 0;
        let mut pivot_idx = 0;
        let live: Vec<usize> = data
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_live())
            .map(|(i, _)| i)
            .collect();
        for (n, &i) in live.iter().enumerate() {
            acc += data.keys[i].u64s_in(&data.format);
            pivot_idx = n;
            if acc >= target {
                break;
            }
        }
        // Keep at least one key on each side.
        pivot_idx = pivot_idx.min(live.len().saturating_sub(2));
        let pivot = data.keys[live[pivot_idx]].pos;
        let old_max = data.max_key;
        let upper: Vec<NodeKey> = data
            .keys
            .iter()
            .filter(|k| k.is_live() && k.pos > pivot)
            .cloned()
            .collect();
        data.keys.retain(|k| k.pos <= pivot);
        data.max_key = pivot;
        data.recount();
        (pivot, old_max, data.format, data.seq, upper)
    };
    assert!(!upper.is_empty(), "split produced an empty sibling");
    let n2 = alloc_empty(update, n1.level, pivot.successor(), old_max, format, seq);
    {
        let mut data = n2.data.lock();
        data.keys = upper;
        data.recount();
    }
    debug!(
        "split: pivot {} ({} left, {} right)",
        pivot,
        n1.data.lock().nr_live,
        n2.data.lock().nr_live
    );
    n2
}

fn set_root(update: &UpdateTransaction, n: &Arc<Node>) {
    update.fs.roots.set_root_inmem(&update.fs.cache, n);
    update.updated_root(n);
}

/// Create an empty leaf root for a fresh btree.
pub fn create_root(fs: &Arc<Filesystem>, btree_id: BtreeId) -> Result<()> {
    let mut update = update::start(fs, btree_id, 1, update::USE_RESERVE)?;
    let n = update.take_prealloc(0);
    shape_node(
        &n,
        KeyPos::MIN,
        KeyPos::MAX,
        KeyFormat::full(),
        fs.next_node_seq(),
        Vec::new(),
    );
    issue_write(&update, &n);
    set_root(&update, &n);
    fs.cache.hash_insert(&n);
    n.lock.unlock_intent();
    update.done();
    Ok(())
}

/// Rewrite `b` in place: identical keys, fresh location and format. Used
/// by GC to defragment.
pub fn rewrite_node(fs: &Arc<Filesystem>, path: &mut BtreePath, level: u8) -> Result<()> {
    let root_level = fs
        .roots
        .root_node(path.btree_id)
        .map(|r| r.level)
        .unwrap_or(level);
    let nr = 2 * (root_level.saturating_sub(level) as usize + 1) + 1;
    let mut update = update::start(fs, path.btree_id, nr, update::USE_RESERVE)?;
    let b = path.node(level).expect("path holds rewrite level").clone();
    split(&mut update, path, &b, KeyList::with_capacity(0))?;
    update.done();
    Ok(())
}

/// Merge the node at `level` with its `side` sibling if their joint size
/// stays under the foreground threshold.
pub fn maybe_merge(
    fs: &Arc<Filesystem>,
    path: &mut BtreePath,
    level: u8,
    side: Side,
) -> Result<()> {
    let b = path.node(level).expect("path holds merge level").clone();
    if !path.has_parent(level) {
        return Ok(());
    }
    {
        let data = b.data.lock();
        let est = data.sib_u64s[side as usize];
        if est as usize > fs.config.foreground_merge_threshold() {
            return Ok(());
        }
    }

    let Some(m) = path.sibling(fs, level, side == Side::Next)? else {
        b.data.lock().sib_u64s[side as usize] = u16::MAX;
        return Ok(());
    };

    // Joint format over both nodes, then the merged size estimate with
    // hysteresis so repeated merges don't oscillate around the threshold.
    let (prev, next) = match side {
        Side::Prev => (m.clone(), b.clone()),
        Side::Next => (b.clone(), m.clone()),
    };
    let joint_format = {
        let mut fb = FormatBuilder::new();
        let pd = prev.data.lock();
        let nd = next.data.lock();
        fb.add_pos(pd.min_key);
        for k in pd.keys.iter().chain(nd.keys.iter()).filter(|k| k.is_live()) {
            fb.add_key(k);
        }
        fb.build()
    };
    let merged_u64s = {
        let pd = prev.data.lock();
        let nd = next.data.lock();
        crate::bkey::format::keys_u64s(&pd.keys, &joint_format)
            + crate::bkey::format::keys_u64s(&nd.keys, &joint_format)
    };
    let mut sib_u64s = merged_u64s;
    let hysteresis = fs.config.foreground_merge_hysteresis();
    if sib_u64s > hysteresis {
        sib_u64s = (sib_u64s - hysteresis) / 2 + hysteresis;
    }
    let clamped = sib_u64s.min(fs.config.btree_node_u64s()).min(u16::MAX as usize);
    b.data.lock().sib_u64s[side as usize] = clamped as u16;

    if sib_u64s > fs.config.foreground_merge_threshold() {
        trace!(
            "merge skipped: joint {} u64s over threshold {}",
            merged_u64s,
            fs.config.foreground_merge_threshold()
        );
        m.lock.unlock_intent();
        return Ok(());
    }

    let root_level = fs
        .roots
        .root_node(path.btree_id)
        .map(|r| r.level)
        .unwrap_or(level);
    let nr = root_level.saturating_sub(level) as usize + 2;
    let mut update = match update::start(fs, path.btree_id, nr, update::USE_RESERVE) {
        Ok(u) => u,
        Err(e) => {
            m.lock.unlock_intent();
            return Err(e);
        }
    };

    b.lock.lock_write();
    m.lock.lock_write();
    will_free_node(&update, &b);
    will_free_node(&update, &m);

    let (min_key, max_key, seq, keys, prev_max) = {
        let pd = prev.data.lock();
        let nd = next.data.lock();
        let mut keys: Vec<NodeKey> = pd.keys.iter().filter(|k| k.is_live()).cloned().collect();
        keys.extend(nd.keys.iter().filter(|k| k.is_live()).cloned());
        (
            pd.min_key,
            nd.max_key,
            pd.seq.max(nd.seq) + 1,
            keys,
            pd.max_key,
        )
    };
    let n = update.take_prealloc(level);
    shape_node(&n, min_key, max_key, joint_format, seq, keys);
    issue_write(&update, &n);

    // The delete replaces the pointer that used to cover `prev`; the new
    // pointer at `next.max_key` takes over the widened range.
    let mut parent_keys = KeyList::with_capacity(2);
    parent_keys.push(NodeKey::whiteout(prev_max));
    parent_keys.push(n.data.lock().node_key());
    insert_node(&mut update, path, level + 1, parent_keys)?;

    b.lock.unlock_write();
    m.lock.unlock_write();
    fs.cache.make_freeable(&b);
    fs.cache.make_freeable(&m);
    path.set_node(n.clone());
    fs.cache.hash_insert(&n);
    m.lock.unlock_intent();

    update.done();
    debug!(
        "merged nodes into {} covering [{}, {}]",
        n.nid, min_key, max_key
    );
    Ok(())
}

/// Atomically replace the pointer key of `b` (e.g. after a replica
/// change). Lookups find the node by either key for the duration; the old
/// hash is removed once the new pointer is on its way to the journal.
pub fn update_key(
    fs: &Arc<Filesystem>,
    path: &mut BtreePath,
    level: u8,
    new_ptr: PtrKey,
) -> Result<()> {
    let b = path.node(level).expect("path holds target level").clone();
    let old_key = b.data.lock().node_key();
    let old_ptr = old_key.ptr().expect("node key is a pointer").clone();

    if ptr_hash(&new_ptr) != ptr_hash(&old_ptr) {
        fs.cache.hash_alias_insert(&b, &new_ptr);
    }

    let is_root = !path.has_parent(level);
    let root_level = fs
        .roots
        .root_node(path.btree_id)
        .map(|r| r.level)
        .unwrap_or(level);
    // A parent insert can itself split; reserve for the worst case.
    let nr = if is_root {
        0
    } else {
        2 * root_level.saturating_sub(level) as usize + 1
    };
    let update = update::start(fs, path.btree_id, nr, update::USE_RESERVE)?;

    b.lock.lock_write();
    {
        let mut data = b.data.lock();
        data.ptr = new_ptr.clone();
    }
    let new_key = b.data.lock().node_key();
    b.lock.unlock_write();

    update.delete_key(old_key);
    update.add_new_key(new_key.clone());
    if is_root {
        fs.roots.update_root_key(b.btree_id, new_key);
        update.updated_root(&b);
        update.done();
    } else {
        let mut update = update;
        let mut keys = KeyList::with_capacity(1);
        keys.push(new_key);
        insert_node(&mut update, path, level + 1, keys)?;
        update.done();
    }
    fs.cache.hash_remove(&old_ptr);
    Ok(())
}
