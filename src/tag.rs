// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Context tags and the re-entrant-by-tag exclusive lock built on top of them.
//!
//! `Buffer::mutex` (§5) is re-entrant not by thread, but by an opaque
//! *context tag* — the same GPU submission context may re-acquire the lock
//! across calls (even from different call sites) without blocking on
//! itself, while a different context always blocks until the owner
//! unlocks. This differs from [`parking_lot::ReentrantMutex`], which is
//! re-entrant by OS thread; the owning "context" here is a caller-supplied
//! identity, not a thread.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Opaque identifier of a calling context (a GPU submission, a render pass).
///
/// The core never interprets the value beyond equality: callers obtain one
/// from [`ContextTag::new`] and pass the same tag back across calls that
/// logically belong to the same execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextTag(u64);

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

impl ContextTag {
    /// Allocates a fresh, process-unique context tag.
    pub fn new() -> Self {
        ContextTag(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextTag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LockState {
    owner: Option<ContextTag>,
}

/// The exclusive, tag-reentrant lock backing [`crate::buffer::Buffer::mutex`].
///
/// Unlocking always fully releases the lock regardless of how many
/// re-entrant `lock_with_tag` calls preceded it (§8 R3) — there is no
/// recursion depth to unwind, only ownership.
#[derive(Debug)]
pub struct TaggedLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl TaggedLock {
    pub fn new() -> Self {
        TaggedLock {
            state: Mutex::new(LockState { owner: None }),
            released: Condvar::new(),
        }
    }

    /// Blocks until the lock is acquired under a fresh, anonymous tag.
    ///
    /// Equivalent to `lock_with_tag` with a tag nobody else could already
    /// hold, so this call always blocks if the lock is currently held
    /// (never treated as a no-op reentry).
    pub fn lock(&self) {
        self.lock_with_tag(ContextTag::new());
    }

    /// Attempts to acquire the lock without blocking. Returns `false`
    /// immediately on contention — no retry loop.
    pub fn try_lock(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        if guard.owner.is_some() {
            return false;
        }
        guard.owner = Some(ContextTag::new());
        true
    }

    /// Acquires the lock under `tag`, blocking if another context owns it.
    ///
    /// Returns `true` if the lock was freshly acquired, `false` if `tag`
    /// already owned it (a no-op reentry — see §8 R3).
    pub fn lock_with_tag(&self, tag: ContextTag) -> bool {
        let mut guard = self.state.lock().unwrap();
        loop {
            match guard.owner {
                Some(owner) if owner == tag => return false,
                None => {
                    guard.owner = Some(tag);
                    return true;
                }
                Some(_) => {
                    guard = self.released.wait(guard).unwrap();
                }
            }
        }
    }

    /// Releases the lock. A single call always fully releases, matching
    /// the no-recursion-depth semantics of `lock_with_tag`.
    pub fn unlock(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.owner = None;
        self.released.notify_all();
    }

    /// The tag currently owning the lock, if any.
    pub fn current_owner(&self) -> Option<ContextTag> {
        self.state.lock().unwrap().owner
    }
}

impl Default for TaggedLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentry_by_tag_is_free() {
        let lock = TaggedLock::new();
        let tag = ContextTag::new();
        assert!(lock.lock_with_tag(tag));
        assert!(!lock.lock_with_tag(tag));
        lock.unlock();
        assert_eq!(lock.current_owner(), None);
    }

    #[test]
    fn different_tag_blocks() {
        let lock = Arc::new(TaggedLock::new());
        let tag_a = ContextTag::new();
        let tag_b = ContextTag::new();
        assert!(lock.lock_with_tag(tag_a));

        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            lock2.lock_with_tag(tag_b);
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        lock.unlock();
        handle.join().unwrap();
    }

    #[test]
    fn try_lock_fails_under_contention() {
        let lock = TaggedLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
    }
}
