//! Packed-key formats and the format planner.
//!
//! A node stores key headers packed to per-field bit widths relative to a
//! per-field base offset. A key whose fields do not fit the node's format is
//! stored with the full unpacked header instead. When a node is rewritten we
//! recompute the narrowest format its live keys fit in; if repacking under
//! that format would overflow the node, the source format is kept.

use super::{NodeKey, KEY_U64S};
use serde::{Deserialize, Serialize};

/// Number of packable header fields: inode, offset, seq, sectors.
pub const NR_KEY_FIELDS: usize = 4;

/// Describes how key headers are packed within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFormat {
    pub key_u64s: u8,
    pub bits_per_field: [u8; NR_KEY_FIELDS],
    pub field_offset: [u64; NR_KEY_FIELDS],
}

impl KeyFormat {
    /// The format every key fits in: full-width fields, no offsets.
    pub fn full() -> Self {
        KeyFormat {
            key_u64s: KEY_U64S as u8,
            bits_per_field: [64; NR_KEY_FIELDS],
            field_offset: [0; NR_KEY_FIELDS],
        }
    }

    /// Whether a key with the given fields can be packed under this format.
    pub fn fits(&self, fields: &[u64; NR_KEY_FIELDS]) -> bool {
        for i in 0..NR_KEY_FIELDS {
            let Some(v) = fields[i].checked_sub(self.field_offset[i]) else {
                return false;
            };
            let bits = self.bits_per_field[i];
            if bits < 64 && v >> bits != 0 {
                return false;
            }
        }
        true
    }
}

impl Default for KeyFormat {
    fn default() -> Self {
        KeyFormat::full()
    }
}

/// Accumulates field-width requirements over a set of keys.
pub struct FormatBuilder {
    min: [u64; NR_KEY_FIELDS],
    max: [u64; NR_KEY_FIELDS],
    seen: bool,
}

impl FormatBuilder {
    pub fn new() -> Self {
        FormatBuilder {
            min: [u64::MAX; NR_KEY_FIELDS],
            max: [0; NR_KEY_FIELDS],
            seen: false,
        }
    }

    pub fn add_key(&mut self, key: &NodeKey) {
        self.add_fields(&key.fields());
    }

    /// Positions (e.g. the node's `min_key`) contribute only the position
    /// fields.
    pub fn add_pos(&mut self, pos: super::KeyPos) {
        self.min[0] = self.min[0].min(pos.inode);
        self.max[0] = self.max[0].max(pos.inode);
        self.min[1] = self.min[1].min(pos.offset);
        self.max[1] = self.max[1].max(pos.offset);
        self.seen = true;
    }

    fn add_fields(&mut self, fields: &[u64; NR_KEY_FIELDS]) {
        for i in 0..NR_KEY_FIELDS {
            self.min[i] = self.min[i].min(fields[i]);
            self.max[i] = self.max[i].max(fields[i]);
        }
        self.seen = true;
    }

    pub fn build(&self) -> KeyFormat {
        if !self.seen {
            return KeyFormat::full();
        }
        let mut bits = [0u8; NR_KEY_FIELDS];
        let mut offset = [0u64; NR_KEY_FIELDS];
        let mut total = 0u32;
        for i in 0..NR_KEY_FIELDS {
            let lo = if self.min[i] == u64::MAX { 0 } else { self.min[i] };
            offset[i] = lo;
            let span = self.max[i].saturating_sub(lo);
            bits[i] = bits_for(span);
            total += bits[i] as u32;
        }
        KeyFormat {
            key_u64s: ((total + 63) / 64).max(1) as u8,
            bits_per_field: bits,
            field_offset: offset,
        }
    }
}

impl Default for FormatBuilder {
    fn default() -> Self {
        FormatBuilder::new()
    }
}

fn bits_for(span: u64) -> u8 {
    (64 - span.leading_zeros()) as u8
}

/// Sum of u64s a set of live keys occupies under `format`.
pub fn keys_u64s(keys: &[NodeKey], format: &KeyFormat) -> usize {
    keys.iter()
        .filter(|k| k.is_live())
        .map(|k| k.u64s_in(format))
        .sum()
}

/// Repacked size per the incremental recount: start from the current live
/// size and adjust each key's header by the width delta of its class
/// (packed in both, or unpacked in the old format).
pub fn repacked_u64s(
    old_live_u64s: usize,
    old: &KeyFormat,
    new: &KeyFormat,
    nr_packed: usize,
    nr_unpacked: usize,
) -> isize {
    let old_key = old.key_u64s as isize;
    let new_key = new.key_u64s as isize;
    let full_key = KEY_U64S as isize;
    old_live_u64s as isize
        + (new_key - old_key) * nr_packed as isize
        + (new_key - full_key) * nr_unpacked as isize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{KeyPos, KeyVal, NodeKey};
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for NodeKey {
        fn arbitrary(g: &mut Gen) -> Self {
            NodeKey {
                pos: KeyPos::new(u64::arbitrary(g) >> 32, u64::arbitrary(g)),
                val: KeyVal::Data {
                    seq: u64::arbitrary(g) >> 48,
                    sectors: u32::arbitrary(g) >> 16,
                    val_u64s: 1 + u32::arbitrary(g) % 4,
                },
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn planned_format_fits_every_key(keys: Vec<NodeKey>) -> bool {
        let mut b = FormatBuilder::new();
        for k in &keys {
            b.add_key(k);
        }
        let f = b.build();
        keys.iter().all(|k| f.fits(&k.fields()))
    }

    #[quickcheck_macros::quickcheck]
    fn planned_format_never_wider_than_full(keys: Vec<NodeKey>) -> bool {
        let mut b = FormatBuilder::new();
        for k in &keys {
            b.add_key(k);
        }
        b.build().key_u64s as usize <= KEY_U64S
    }

    #[test]
    fn repack_recount_matches_direct_recount() {
        let keys: Vec<_> = (0..32)
            .map(|i| NodeKey {
                pos: KeyPos::new(4, 100 + i),
                val: KeyVal::Data {
                    seq: 7,
                    sectors: 8,
                    val_u64s: 2,
                },
            })
            .collect();
        let old = KeyFormat::full();
        let mut b = FormatBuilder::new();
        for k in &keys {
            b.add_key(k);
        }
        let new = b.build();

        let old_live = keys_u64s(&keys, &old);
        let nr_packed = keys.iter().filter(|k| old.fits(&k.fields())).count();
        let nr_unpacked = keys.len() - nr_packed;
        let recount = repacked_u64s(old_live, &old, &new, nr_packed, nr_unpacked);
        assert_eq!(recount, keys_u64s(&keys, &new) as isize);
    }

    #[test]
    fn offset_below_base_does_not_fit() {
        let f = KeyFormat {
            key_u64s: 1,
            bits_per_field: [8; NR_KEY_FIELDS],
            field_offset: [100, 0, 0, 0],
        };
        assert!(!f.fits(&[50, 0, 0, 0]));
        assert!(f.fits(&[150, 0, 0, 0]));
        assert!(!f.fits(&[100 + 256, 0, 0, 0]));
    }
}
