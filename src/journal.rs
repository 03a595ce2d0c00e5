//! The journal: sequence numbers, pre-reservations, pins, and entries.
//!
//! The interior-update engine consumes a narrow slice of the journal: it
//! pre-reserves space before a topology change starts, appends `BtreeKeys`
//! (parent insertions) and `BtreeRoot` entries from the finalizer, and holds
//! pins so reclaim never overwrites an entry a pending topology change still
//! depends on. Every sealed entry carries a complete root snapshot so
//! recovery can start from any suffix of the log.

use crate::{
    bkey::{NodeKey, KEY_U64S},
    error::{Error, Result},
    BtreeId,
};
use log::{error, trace};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// A key insertion into a node at `level` of `btree_id`.
    BtreeKeys {
        btree_id: BtreeId,
        level: u8,
        key: NodeKey,
    },
    /// Registry snapshot entry: the root of `btree_id`.
    BtreeRoot {
        btree_id: BtreeId,
        level: u8,
        key: NodeKey,
    },
}

impl JournalEntry {
    pub fn u64s(&self) -> u64 {
        let key = match self {
            JournalEntry::BtreeKeys { key, .. } => key,
            JournalEntry::BtreeRoot { key, .. } => key,
        };
        2 + KEY_U64S as u64 + key.val_u64s() as u64
    }
}

/// Space reserved for a future commit, returnable if unused.
#[derive(Debug)]
pub struct JournalPreres {
    pub u64s: u64,
}

/// Holds journal entries from `seq` onwards against reclaim.
#[derive(Debug, Default)]
pub struct JournalPin {
    seq: Option<u64>,
}

impl JournalPin {
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn is_armed(&self) -> bool {
        self.seq.is_some()
    }
}

struct Sealed {
    seq: u64,
    /// Space still charged against the preres pool; zero once reclaimed.
    cost: u64,
    bytes: Vec<u8>,
}

struct JournalState {
    /// Sequence number of the currently open entry.
    seq: u64,
    open: Vec<JournalEntry>,
    open_cost: u64,
    remaining: u64,
    log: Vec<Sealed>,
    pins: BTreeMap<u64, usize>,
}

pub struct Journal {
    state: Mutex<JournalState>,
    preres_cond: Condvar,
    capacity: u64,
    err: AtomicBool,
}

impl Journal {
    pub fn new(capacity_u64s: u64) -> Self {
        Journal {
            state: Mutex::new(JournalState {
                seq: 1,
                open: Vec::new(),
                open_cost: 0,
                remaining: capacity_u64s,
                log: Vec::new(),
                pins: BTreeMap::new(),
            }),
            preres_cond: Condvar::new(),
            capacity: capacity_u64s,
            err: AtomicBool::new(false),
        }
    }

    pub fn error(&self) -> bool {
        self.err.load(Ordering::Acquire)
    }

    pub fn set_error(&self) {
        error!("journal entering error state");
        self.err.store(true, Ordering::Release);
    }

    /// Sequence number the next appended entry will land in.
    pub fn cur_seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Newest sealed sequence, if any.
    pub fn last_sealed_seq(&self) -> Option<u64> {
        self.state.lock().log.last().map(|s| s.seq)
    }

    pub fn preres_get(&self, u64s: u64, nonblock: bool) -> Result<JournalPreres> {
        if self.error() {
            return Err(Error::JournalError);
        }
        if u64s > self.capacity {
            return Err(Error::NoSpaceJournal);
        }
        let mut s = self.state.lock();
        loop {
            self.reclaim(&mut s);
            if s.remaining >= u64s {
                s.remaining -= u64s;
                trace!("journal preres: {} u64s ({} left)", u64s, s.remaining);
                return Ok(JournalPreres { u64s });
            }
            if nonblock {
                return Err(Error::WouldBlock);
            }
            self.preres_cond.wait(&mut s);
            if self.error() {
                return Err(Error::JournalError);
            }
        }
    }

    pub fn preres_put(&self, preres: JournalPreres) {
        let mut s = self.state.lock();
        s.remaining += preres.u64s;
        drop(s);
        self.preres_cond.notify_all();
    }

    /// Append entries to the open journal entry, consuming reserved space.
    /// Returns the sequence number the entries will be sealed in.
    pub fn entries_add(&self, preres: &mut JournalPreres, entries: &[JournalEntry]) -> u64 {
        let cost: u64 = entries.iter().map(|e| e.u64s()).sum();
        assert!(preres.u64s >= cost, "journal write exceeds preres");
        preres.u64s -= cost;
        let mut s = self.state.lock();
        s.open_cost += cost;
        s.open.extend_from_slice(entries);
        s.seq
    }

    /// Seal the open entry. `roots` is the complete root snapshot to embed;
    /// it rides along outside preres accounting.
    pub fn commit(&self, roots: Vec<JournalEntry>) -> Result<u64> {
        let mut s = self.state.lock();
        let mut entries = std::mem::take(&mut s.open);
        entries.extend(roots);
        let bytes = bincode::serialize(&entries)?;
        let seq = s.seq;
        let cost = s.open_cost;
        s.open_cost = 0;
        s.log.push(Sealed { seq, cost, bytes });
        s.seq += 1;
        self.reclaim(&mut s);
        drop(s);
        self.preres_cond.notify_all();
        trace!("journal commit: seq {}", seq);
        Ok(seq)
    }

    /// Return sealed space older than the oldest pin to the preres pool.
    fn reclaim(&self, s: &mut JournalState) {
        let oldest_pin = s.pins.keys().next().copied().unwrap_or(u64::MAX);
        let mut freed = 0;
        for sealed in s.log.iter_mut() {
            if sealed.seq >= oldest_pin {
                break;
            }
            freed += std::mem::take(&mut sealed.cost);
        }
        if freed > 0 {
            s.remaining += freed;
            trace!("journal reclaim: {} u64s", freed);
        }
    }

    pub fn pin_add(&self, seq: u64) -> JournalPin {
        let mut s = self.state.lock();
        *s.pins.entry(seq).or_insert(0) += 1;
        JournalPin { seq: Some(seq) }
    }

    /// Make `dst` hold (at least) everything `src` holds: `dst` ends up
    /// pinned at the older of the two sequence numbers.
    pub fn pin_copy(&self, dst: &mut JournalPin, src: &JournalPin) {
        let Some(src_seq) = src.seq else { return };
        match dst.seq {
            Some(dst_seq) if dst_seq <= src_seq => {}
            _ => {
                let mut s = self.state.lock();
                *s.pins.entry(src_seq).or_insert(0) += 1;
                if let Some(dst_seq) = dst.seq.take() {
                    Self::pin_sub(&mut s, dst_seq);
                }
                dst.seq = Some(src_seq);
            }
        }
    }

    pub fn pin_drop(&self, pin: &mut JournalPin) {
        if let Some(seq) = pin.seq.take() {
            let mut s = self.state.lock();
            Self::pin_sub(&mut s, seq);
            self.reclaim(&mut s);
            drop(s);
            self.preres_cond.notify_all();
        }
    }

    fn pin_sub(s: &mut JournalState, seq: u64) {
        let count = s.pins.get_mut(&seq).expect("pin accounting");
        *count -= 1;
        if *count == 0 {
            s.pins.remove(&seq);
        }
    }

    pub fn oldest_pinned(&self) -> Option<u64> {
        self.state.lock().pins.keys().next().copied()
    }

    /// Decode the sealed entry with the given sequence number.
    pub fn read_sealed(&self, seq: u64) -> Option<Vec<JournalEntry>> {
        let s = self.state.lock();
        s.log
            .iter()
            .find(|e| e.seq == seq)
            .map(|e| bincode::deserialize(&e.bytes).expect("journal entry decodes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{KeyPos, KeyVal};

    fn entry(off: u64) -> JournalEntry {
        JournalEntry::BtreeKeys {
            btree_id: BtreeId(0),
            level: 1,
            key: NodeKey {
                pos: KeyPos::new(0, off),
                val: KeyVal::Whiteout,
            },
        }
    }

    #[test]
    fn preres_nowait_when_full() {
        let j = Journal::new(16);
        let p = j.preres_get(16, true).unwrap();
        assert!(matches!(j.preres_get(1, true), Err(Error::WouldBlock)));
        j.preres_put(p);
        let p = j.preres_get(1, true).unwrap();
        j.preres_put(p);
    }

    #[test]
    fn pinned_entries_are_not_reclaimed() {
        let j = Journal::new(64);
        let mut p = j.preres_get(32, true).unwrap();
        let seq = j.entries_add(&mut p, &[entry(1)]);
        let mut pin = j.pin_add(seq);
        j.preres_put(p);
        j.commit(vec![]).unwrap();

        // Everything unconsumed came back, the sealed cost did not.
        let cost = entry(1).u64s();
        assert!(matches!(
            j.preres_get(64 - cost + 1, true),
            Err(Error::WouldBlock)
        ));
        j.pin_drop(&mut pin);
        let p = j.preres_get(64, true).unwrap();
        j.preres_put(p);
    }

    #[test]
    fn pin_copy_keeps_the_older_seq() {
        let j = Journal::new(1024);
        let mut old = j.pin_add(1);
        let newer = j.pin_add(5);
        let mut dst = JournalPin::default();
        j.pin_copy(&mut dst, &newer);
        j.pin_copy(&mut dst, &old);
        assert_eq!(dst.seq(), Some(1));
        j.pin_drop(&mut old);
        assert_eq!(j.oldest_pinned(), Some(1));
        j.pin_drop(&mut dst);
        assert_eq!(j.oldest_pinned(), Some(5));
        let mut newer = newer;
        j.pin_drop(&mut newer);
        assert_eq!(j.oldest_pinned(), None);
    }

    #[test]
    fn error_state_rejects_new_preres() {
        let j = Journal::new(64);
        j.set_error();
        assert!(matches!(j.preres_get(1, true), Err(Error::JournalError)));
    }
}
