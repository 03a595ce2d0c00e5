//! Key positions and node pointer keys.
//!
//! Interior nodes hold pointer keys: the position of such a key is the
//! covered child's `max_key`, its value locates the child on disk. Pointer
//! keys come in two versions which every callsite must match exhaustively;
//! v2 additionally records the child's `min_key`, sequence number and
//! written-sector counts and is emitted when the filesystem advertises the
//! feature.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod format;

pub use format::{FormatBuilder, KeyFormat, NR_KEY_FIELDS};

/// Width of an unpacked key header in u64s.
pub const KEY_U64S: usize = 4;

/// A position in the total order over keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

impl KeyPos {
    pub const MIN: KeyPos = KeyPos {
        inode: 0,
        offset: 0,
    };
    pub const MAX: KeyPos = KeyPos {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    pub fn new(inode: u64, offset: u64) -> Self {
        KeyPos { inode, offset }
    }

    /// The immediate next position. Saturates at [KeyPos::MAX].
    pub fn successor(self) -> Self {
        match self.offset.checked_add(1) {
            Some(offset) => KeyPos {
                inode: self.inode,
                offset,
            },
            None => match self.inode.checked_add(1) {
                Some(inode) => KeyPos { inode, offset: 0 },
                None => KeyPos::MAX,
            },
        }
    }
}

impl fmt::Display for KeyPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// One replica pointer, sector granular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskPtr {
    pub dev: u8,
    pub offset: u64,
}

/// The on-disk identity of a btree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PtrKey {
    /// Pointers only.
    V1 { ptrs: Vec<DiskPtr> },
    /// Pointers plus node metadata.
    V2 {
        ptrs: Vec<DiskPtr>,
        min_key: KeyPos,
        seq: u64,
        sectors_written: u32,
        sectors: u32,
    },
}

impl PtrKey {
    pub fn ptrs(&self) -> &[DiskPtr] {
        match self {
            PtrKey::V1 { ptrs } => ptrs,
            PtrKey::V2 { ptrs, .. } => ptrs,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            PtrKey::V1 { .. } => 0,
            PtrKey::V2 { seq, .. } => *seq,
        }
    }

    pub fn sectors(&self) -> u32 {
        match self {
            PtrKey::V1 { .. } => 0,
            PtrKey::V2 { sectors, .. } => *sectors,
        }
    }

    /// Value size in u64s of the serialized form.
    pub fn val_u64s(&self) -> usize {
        match self {
            PtrKey::V1 { ptrs } => 1 + ptrs.len(),
            PtrKey::V2 { ptrs, .. } => 3 + ptrs.len(),
        }
    }
}

/// Value of a key held in a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyVal {
    /// Interior: locates a child node.
    Ptr(PtrKey),
    /// Leaf payload. Opaque here apart from its packed fields and size.
    Data { seq: u64, sectors: u32, val_u64s: u32 },
    /// Deletion marker. Not live.
    Whiteout,
}

/// A single key as held in a node or keylist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKey {
    pub pos: KeyPos,
    pub val: KeyVal,
}

impl NodeKey {
    pub fn new_ptr(pos: KeyPos, ptr: PtrKey) -> Self {
        NodeKey {
            pos,
            val: KeyVal::Ptr(ptr),
        }
    }

    pub fn whiteout(pos: KeyPos) -> Self {
        NodeKey {
            pos,
            val: KeyVal::Whiteout,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.val, KeyVal::Whiteout)
    }

    /// The four packable fields: inode, offset, seq, sectors.
    pub fn fields(&self) -> [u64; NR_KEY_FIELDS] {
        let (seq, sectors) = match &self.val {
            KeyVal::Ptr(p) => (p.seq(), p.sectors() as u64),
            KeyVal::Data { seq, sectors, .. } => (*seq, *sectors as u64),
            KeyVal::Whiteout => (0, 0),
        };
        [self.pos.inode, self.pos.offset, seq, sectors]
    }

    pub fn val_u64s(&self) -> usize {
        match &self.val {
            KeyVal::Ptr(p) => p.val_u64s(),
            KeyVal::Data { val_u64s, .. } => *val_u64s as usize,
            KeyVal::Whiteout => 0,
        }
    }

    /// Size of this key in u64s when its header is packed under `format`,
    /// falling back to the unpacked header width.
    pub fn u64s_in(&self, format: &KeyFormat) -> usize {
        let header = if format.fits(&self.fields()) {
            format.key_u64s as usize
        } else {
            KEY_U64S
        };
        header + self.val_u64s()
    }

    pub fn ptr(&self) -> Option<&PtrKey> {
        match &self.val {
            KeyVal::Ptr(p) => Some(p),
            _ => None,
        }
    }
}

/// Scratch list of keys describing a topology delta.
///
/// Capacity is fixed up front from the number of nodes an update reserved,
/// so pushing past it is a programmer error.
#[derive(Debug)]
pub struct KeyList {
    keys: Vec<NodeKey>,
    cap: usize,
}

impl KeyList {
    pub fn with_capacity(cap: usize) -> Self {
        KeyList {
            keys: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, key: NodeKey) {
        assert!(self.keys.len() < self.cap, "keylist overflow");
        self.keys.push(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_carries_into_inode() {
        let p = KeyPos::new(7, u64::MAX);
        assert_eq!(p.successor(), KeyPos::new(8, 0));
        assert_eq!(KeyPos::new(7, 3).successor(), KeyPos::new(7, 4));
        assert_eq!(KeyPos::MAX.successor(), KeyPos::MAX);
    }

    #[test]
    fn ptr_versions_differ_in_val_size() {
        let ptrs = vec![DiskPtr { dev: 0, offset: 64 }];
        let v1 = PtrKey::V1 { ptrs: ptrs.clone() };
        let v2 = PtrKey::V2 {
            ptrs,
            min_key: KeyPos::MIN,
            seq: 1,
            sectors_written: 64,
            sectors: 64,
        };
        assert_eq!(v1.val_u64s() + 2, v2.val_u64s());
    }

    #[test]
    #[should_panic(expected = "keylist overflow")]
    fn keylist_capacity_is_hard() {
        let mut l = KeyList::with_capacity(1);
        l.push(NodeKey::whiteout(KeyPos::MIN));
        l.push(NodeKey::whiteout(KeyPos::MAX));
    }
}
