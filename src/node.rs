//! In-memory btree node descriptors.
//!
//! A descriptor carries the node's identity (btree id, level, pointer key),
//! its sorted key set with u64 accounting under the node's packed format,
//! its lifecycle flags, and the journal pins of its dirty window. The
//! pointer metadata lives in the node's own key; everything else is
//! reconstructible from the packed image.

use crate::{
    alloc::OpenBucket,
    bkey::{KeyFormat, KeyPos, KeyVal, NodeKey, PtrKey, KEY_U64S},
    journal::{Journal, JournalPin},
    lock::NodeLock,
    BtreeId,
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod flags {
    pub const DIRTY: u64 = 1 << 0;
    /// First (data-placing) write has completed.
    pub const DATA_WRITTEN: u64 = 1 << 1;
    pub const WRITE_IN_FLIGHT: u64 = 1 << 2;
    pub const DYING: u64 = 1 << 3;
    /// Descriptor not yet backed by an on-disk node.
    pub const FAKE: u64 = 1 << 4;
    pub const ACCESSED: u64 = 1 << 5;
    /// GC wants this node rewritten; the next interior insert takes the
    /// split path regardless of fit.
    pub const NEED_REWRITE: u64 = 1 << 6;
    /// Exempt from cache eviction (roots).
    pub const NOEVICT: u64 = 1 << 7;
}

const NODE_MAGIC: u32 = 0x62_74_6e_64;

pub struct Node {
    /// Stable in-memory identity, never reused within one mount.
    pub nid: u64,
    pub btree_id: BtreeId,
    pub level: u8,
    pub lock: NodeLock,
    flags: AtomicU64,
    /// Id of the update that must commit before this node is reachable;
    /// zero when none.
    will_make_reachable: AtomicU64,
    pub data: Mutex<NodeData>,
}

pub struct NodeData {
    /// The node's own pointer value. Its position is `max_key`.
    pub ptr: PtrKey,
    pub min_key: KeyPos,
    pub max_key: KeyPos,
    pub format: KeyFormat,
    /// Bumped every time the node is rewritten to a new location.
    pub seq: u64,
    /// Sorted by position, at most one key per position.
    pub keys: Vec<NodeKey>,
    pub nr_live: usize,
    pub nr_packed: usize,
    pub nr_unpacked: usize,
    pub live_u64s: usize,
    /// Estimated merged size with the {prev, next} sibling; `u16::MAX`
    /// records "no sibling".
    pub sib_u64s: [u16; 2],
    /// Monotonic lower bound on the journal seq of the last insertion.
    pub bset_journal_seq: u64,
    /// Pins of the current and previous dirty window.
    pub journal_pins: [JournalPin; 2],
    /// Allocator reservations backing this node's sectors, held until the
    /// publishing update commits.
    pub open_buckets: Vec<OpenBucket>,
}

impl Node {
    pub fn new(nid: u64, btree_id: BtreeId, level: u8, ptr: PtrKey) -> Self {
        Node {
            nid,
            btree_id,
            level,
            lock: NodeLock::default(),
            flags: AtomicU64::new(0),
            will_make_reachable: AtomicU64::new(0),
            data: Mutex::new(NodeData {
                ptr,
                min_key: KeyPos::MIN,
                max_key: KeyPos::MAX,
                format: KeyFormat::full(),
                seq: 0,
                keys: Vec::new(),
                nr_live: 0,
                nr_packed: 0,
                nr_unpacked: 0,
                live_u64s: 0,
                sib_u64s: [0; 2],
                bset_journal_seq: 0,
                journal_pins: [JournalPin::default(), JournalPin::default()],
                open_buckets: Vec::new(),
            }),
        }
    }

    pub fn flag_set(&self, flag: u64) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn flag_clear(&self, flag: u64) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn flag(&self, flag: u64) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Mark this node as made reachable by update `id`. Returns false if
    /// another update already claims it.
    pub fn set_will_make_reachable(&self, id: u64) -> bool {
        self.will_make_reachable
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn will_make_reachable(&self) -> Option<u64> {
        match self.will_make_reachable.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Clear the pending-reachability mark, returning the update id that
    /// held it.
    pub fn take_will_make_reachable(&self) -> Option<u64> {
        match self.will_make_reachable.swap(0, Ordering::AcqRel) {
            0 => None,
            id => Some(id),
        }
    }
}

impl NodeData {
    /// The key this node is published under in its parent.
    pub fn node_key(&self) -> NodeKey {
        NodeKey::new_ptr(self.max_key, self.ptr.clone())
    }

    /// Apply one key to the sorted set: a live key inserts or replaces at
    /// its position, a whiteout removes. Position must lie within
    /// `[min_key, max_key]`.
    pub fn apply_key(&mut self, key: NodeKey) {
        assert!(
            key.pos >= self.min_key && key.pos <= self.max_key,
            "key {} outside node range [{}, {}]",
            key.pos,
            self.min_key,
            self.max_key
        );
        match self.keys.binary_search_by(|k| k.pos.cmp(&key.pos)) {
            Ok(i) => {
                if key.is_live() {
                    self.keys[i] = key;
                } else {
                    self.keys.remove(i);
                }
            }
            Err(i) => {
                if key.is_live() {
                    self.keys.insert(i, key);
                }
            }
        }
        self.recount();
    }

    /// Recompute key accounting under the current format.
    pub fn recount(&mut self) {
        let mut live = 0;
        let mut packed = 0;
        let mut unpacked = 0;
        let mut u64s = 0;
        for k in self.keys.iter().filter(|k| k.is_live()) {
            live += 1;
            if self.format.fits(&k.fields()) {
                packed += 1;
            } else {
                unpacked += 1;
            }
            u64s += k.u64s_in(&self.format);
        }
        self.nr_live = live;
        self.nr_packed = packed;
        self.nr_unpacked = unpacked;
        self.live_u64s = u64s;
    }

    /// Raise the recovery lower bound; never moves backwards.
    pub fn journal_seq_advance(&mut self, seq: u64) {
        self.bset_journal_seq = self.bset_journal_seq.max(seq);
    }

    /// Pin the journal at `seq` for the current dirty window.
    pub fn pin_dirty(&mut self, journal: &Journal, seq: u64) {
        if !self.journal_pins[0].is_armed() {
            self.journal_pins[0] = journal.pin_add(seq);
        }
    }

    /// Called when a write is dispatched: the current window becomes the
    /// previous one.
    pub fn write_started(&mut self, journal: &Journal) {
        let prev = std::mem::take(&mut self.journal_pins[0]);
        let mut old = std::mem::replace(&mut self.journal_pins[1], prev);
        journal.pin_drop(&mut old);
    }

    /// Called when a write completes: the previous window is durable.
    pub fn write_done(&mut self, journal: &Journal) {
        let mut prev = std::mem::take(&mut self.journal_pins[1]);
        journal.pin_drop(&mut prev);
    }

    /// Serialized image of this node: header, format, then the key section.
    pub fn pack(&self, btree_id: BtreeId, level: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.keys.len() * 8 * KEY_U64S);
        out.write_u32::<LittleEndian>(NODE_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(btree_id.0).unwrap();
        out.write_u8(level).unwrap();
        out.write_u8(self.format.key_u64s).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u64::<LittleEndian>(self.seq).unwrap();
        out.write_u64::<LittleEndian>(self.bset_journal_seq).unwrap();
        out.write_u64::<LittleEndian>(self.min_key.inode).unwrap();
        out.write_u64::<LittleEndian>(self.min_key.offset).unwrap();
        out.write_u64::<LittleEndian>(self.max_key.inode).unwrap();
        out.write_u64::<LittleEndian>(self.max_key.offset).unwrap();
        for i in 0..crate::bkey::NR_KEY_FIELDS {
            out.write_u8(self.format.bits_per_field[i]).unwrap();
        }
        for i in 0..crate::bkey::NR_KEY_FIELDS {
            out.write_u64::<LittleEndian>(self.format.field_offset[i])
                .unwrap();
        }
        out.extend_from_slice(&self.pack_keys());
        out
    }

    /// The key section alone; two nodes with equal live key sets produce
    /// identical bytes here regardless of location.
    pub fn pack_keys(&self) -> Vec<u8> {
        let live: Vec<NodeKey> = self.keys.iter().filter(|k| k.is_live()).cloned().collect();
        bincode::serialize(&live).expect("keys serialize")
    }

    /// Child pointer covering `pos`: the first key with position >= `pos`.
    pub fn child_covering(&self, pos: KeyPos) -> Option<&NodeKey> {
        self.keys
            .iter()
            .filter(|k| k.is_live())
            .find(|k| k.pos >= pos)
    }
}

/// Decoded node header, for recovery-style reads of the packed image.
#[derive(Debug, PartialEq, Eq)]
pub struct NodeImage {
    pub btree_id: BtreeId,
    pub level: u8,
    pub seq: u64,
    pub bset_journal_seq: u64,
    pub min_key: KeyPos,
    pub max_key: KeyPos,
    pub keys: Vec<NodeKey>,
}

impl NodeImage {
    pub fn unpack(bytes: &[u8]) -> Option<NodeImage> {
        if bytes.len() < 60 || LittleEndian::read_u32(&bytes[0..4]) != NODE_MAGIC {
            return None;
        }
        let btree_id = BtreeId(LittleEndian::read_u32(&bytes[4..8]));
        let level = bytes[8];
        let seq = LittleEndian::read_u64(&bytes[12..20]);
        let bset_journal_seq = LittleEndian::read_u64(&bytes[20..28]);
        let min_key = KeyPos::new(
            LittleEndian::read_u64(&bytes[28..36]),
            LittleEndian::read_u64(&bytes[36..44]),
        );
        let max_key = KeyPos::new(
            LittleEndian::read_u64(&bytes[44..52]),
            LittleEndian::read_u64(&bytes[52..60]),
        );
        let off = 60 + crate::bkey::NR_KEY_FIELDS * 9;
        if bytes.len() < off {
            return None;
        }
        let keys: Vec<NodeKey> = bincode::deserialize(&bytes[off..]).ok()?;
        Some(NodeImage {
            btree_id,
            level,
            seq,
            bset_journal_seq,
            min_key,
            max_key,
            keys,
        })
    }
}

/// Convenience used by interior code: whether a set of keys spans the node
/// range with no gaps or overlaps.
pub fn children_span_exactly(keys: &[NodeKey], min_key: KeyPos, max_key: KeyPos) -> bool {
    let live: Vec<&NodeKey> = keys.iter().filter(|k| k.is_live()).collect();
    let Some((last, rest)) = live.split_last() else {
        return false;
    };
    if last.pos != max_key {
        return false;
    }
    let mut expect_min = min_key;
    for k in rest.iter().chain(std::iter::once(last)) {
        let Some(ptr) = k.ptr() else { return false };
        let child_min = match ptr {
            PtrKey::V2 { min_key, .. } => *min_key,
            PtrKey::V1 { .. } => expect_min,
        };
        if child_min != expect_min {
            return false;
        }
        expect_min = k.pos.successor();
    }
    true
}

/// Test helper shared across the crate: a leaf data key of known size.
pub fn data_key(pos: KeyPos, val_u64s: u32) -> NodeKey {
    NodeKey {
        pos,
        val: KeyVal::Data {
            seq: 0,
            sectors: 0,
            val_u64s,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::DiskPtr;

    fn node_data() -> NodeData {
        let n = Node::new(
            1,
            BtreeId(0),
            0,
            PtrKey::V1 {
                ptrs: vec![DiskPtr { dev: 0, offset: 0 }],
            },
        );
        n.data.into_inner()
    }

    #[test]
    fn apply_key_replaces_and_removes() {
        let mut d = node_data();
        d.apply_key(data_key(KeyPos::new(0, 5), 2));
        d.apply_key(data_key(KeyPos::new(0, 3), 2));
        assert_eq!(d.nr_live, 2);
        assert_eq!(d.keys[0].pos, KeyPos::new(0, 3));

        d.apply_key(data_key(KeyPos::new(0, 5), 4));
        assert_eq!(d.nr_live, 2);

        d.apply_key(NodeKey::whiteout(KeyPos::new(0, 3)));
        assert_eq!(d.nr_live, 1);
        assert_eq!(d.keys[0].pos, KeyPos::new(0, 5));
    }

    #[test]
    #[should_panic(expected = "outside node range")]
    fn apply_key_outside_range_asserts() {
        let mut d = node_data();
        d.max_key = KeyPos::new(0, 10);
        d.apply_key(data_key(KeyPos::new(1, 0), 1));
    }

    #[test]
    fn pack_keys_ignores_location() {
        let mut a = node_data();
        let mut b = node_data();
        b.ptr = PtrKey::V1 {
            ptrs: vec![DiskPtr {
                dev: 0,
                offset: 4096,
            }],
        };
        for d in [&mut a, &mut b] {
            d.apply_key(data_key(KeyPos::new(0, 1), 2));
            d.apply_key(data_key(KeyPos::new(0, 2), 2));
        }
        assert_eq!(a.pack_keys(), b.pack_keys());
    }

    #[test]
    fn image_roundtrip() {
        let mut d = node_data();
        d.min_key = KeyPos::new(0, 0);
        d.max_key = KeyPos::new(0, 100);
        d.apply_key(data_key(KeyPos::new(0, 1), 2));
        d.apply_key(data_key(KeyPos::new(0, 7), 3));
        d.seq = 9;
        let img = NodeImage::unpack(&d.pack(BtreeId(3), 0)).unwrap();
        assert_eq!(img.btree_id, BtreeId(3));
        assert_eq!(img.seq, 9);
        assert_eq!(img.keys, d.keys);
        assert_eq!(img.max_key, KeyPos::new(0, 100));
    }
}
