//! Three-mode per-node lock.
//!
//! `read` may overlap `read`. `intent` excludes `intent` and `write` but
//! allows concurrent readers, so a thread planning a mutation can hold the
//! node across a long build phase without blocking lookups. `write` excludes
//! everything and is only ever taken as an upgrade by the current intent
//! holder.
//!
//! Lock ownership is protocol state, not borrow state: locks are taken and
//! released at different points of an update's lifecycle and may be handed
//! between the foreground path and the finalizer. They are therefore
//! explicit operations rather than RAII guards.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    intent: bool,
    write: bool,
}

pub struct NodeLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Default for NodeLock {
    fn default() -> Self {
        NodeLock {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }
}

impl NodeLock {
    pub fn lock_read(&self) {
        let mut s = self.state.lock();
        while s.write {
            self.cond.wait(&mut s);
        }
        s.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut s = self.state.lock();
        assert!(s.readers > 0);
        s.readers -= 1;
        drop(s);
        self.cond.notify_all();
    }

    pub fn lock_intent(&self) {
        let mut s = self.state.lock();
        while s.intent || s.write {
            self.cond.wait(&mut s);
        }
        s.intent = true;
    }

    pub fn try_lock_intent(&self) -> bool {
        let mut s = self.state.lock();
        if s.intent || s.write {
            return false;
        }
        s.intent = true;
        true
    }

    pub fn unlock_intent(&self) {
        let mut s = self.state.lock();
        assert!(s.intent && !s.write, "intent released out of order");
        s.intent = false;
        drop(s);
        self.cond.notify_all();
    }

    /// Upgrade to `write`. The caller must hold `intent`.
    pub fn lock_write(&self) {
        let mut s = self.state.lock();
        assert!(s.intent, "write lock without intent");
        while s.readers > 0 {
            self.cond.wait(&mut s);
        }
        s.write = true;
    }

    /// Drop back to `intent`.
    pub fn unlock_write(&self) {
        let mut s = self.state.lock();
        assert!(s.write);
        s.write = false;
        drop(s);
        self.cond.notify_all();
    }

    /// Release whatever is held, outermost mode given.
    pub fn unlock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.unlock_read(),
            LockMode::Intent => self.unlock_intent(),
            LockMode::Write => {
                self.unlock_write();
                self.unlock_intent();
            }
        }
    }

    #[cfg(test)]
    fn held(&self) -> (usize, bool, bool) {
        let s = self.state.lock();
        (s.readers, s.intent, s.write)
    }
}
