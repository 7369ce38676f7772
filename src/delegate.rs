// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Stable indirection into a (possibly migrating) buffer.
//!
//! A [`BufferDelegate`] either points directly at a `Buffer`, or is
//! write-once `link`ed to another delegate with an additive offset (§4.2).
//! Chains are acyclic and immutable once linked, so [`BufferDelegate::get_buffer`]
//! and [`BufferDelegate::get_offset`] always terminate (§8 invariant 5).
use std::sync::{Mutex, OnceLock, Weak};

use crate::buffer::Buffer;
use crate::stable_address_vec::StableAddressVec;

struct DelegateLink {
    target: *const BufferDelegate,
    offset: u64,
}

/// A stable handle that can be linked to forward references to a
/// replacement buffer (§3, §4.2).
///
/// `BufferDelegate`s are only ever created by a [`DelegateArena`], which
/// guarantees the address a delegate is born at never moves or is freed —
/// the raw pointer inside `link` stays valid for the arena's entire life.
pub struct BufferDelegate {
    buffer: Weak<Buffer>,
    link: OnceLock<DelegateLink>,
}

// SAFETY: the only non-Send/Sync field is the raw pointer inside `link`,
// which always points into a `DelegateArena` chunk that is never moved or
// freed while any `BufferDelegate` referencing it is reachable (arena
// lifetime is bound to the buffer manager, not to any one buffer, per §9).
unsafe impl Send for BufferDelegate {}
unsafe impl Sync for BufferDelegate {}

impl std::fmt::Debug for BufferDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDelegate")
            .field("linked", &self.link.get().is_some())
            .finish_non_exhaustive()
    }
}

impl BufferDelegate {
    fn new(buffer: Weak<Buffer>) -> Self {
        BufferDelegate {
            buffer,
            link: OnceLock::new(),
        }
    }

    /// Walks the link chain and returns the buffer it currently resolves to,
    /// or `None` if that buffer has since been dropped.
    pub fn get_buffer(&self) -> Option<std::sync::Arc<Buffer>> {
        let (terminal, _) = self.resolve_chain();
        // SAFETY: see `resolve_chain`.
        unsafe { &*terminal }.buffer.upgrade()
    }

    /// Sums the additive offsets along the link chain.
    pub fn get_offset(&self) -> u64 {
        self.resolve_chain().1
    }

    /// Links this delegate to `target`, with an additive `offset`.
    ///
    /// Links are write-once: linking an already-linked delegate is a
    /// programmer error and panics (§7).
    pub fn link(&self, target: &BufferDelegate, offset: u64) {
        self.link
            .set(DelegateLink {
                target: target as *const BufferDelegate,
                offset,
            })
            .unwrap_or_else(|_| panic!("BufferDelegate::link called on an already-linked delegate"));
    }

    pub fn is_linked(&self) -> bool {
        self.link.get().is_some()
    }

    /// Resolves to `(terminal_delegate_ptr, accumulated_offset)`, walking
    /// past every link. The returned pointer is valid for as long as the
    /// owning arena lives.
    pub(crate) fn resolve_chain(&self) -> (*const BufferDelegate, u64) {
        let mut current: *const BufferDelegate = self;
        let mut offset = 0u64;
        loop {
            // SAFETY: `current` always originates from either `self` (a
            // live reference) or a previous `link.target`, which by the
            // arena's invariant is still valid.
            let cur_ref = unsafe { &*current };
            match cur_ref.link.get() {
                Some(link) => {
                    offset += link.offset;
                    current = link.target;
                }
                None => return (current, offset),
            }
        }
    }
}

const ARENA_CHUNK_CAPACITY: usize = 256;

/// Owns every [`BufferDelegate`] ever created, with lifetime bound to the
/// buffer manager rather than to any one buffer (§9) — so delegate chains
/// never dangle even after the buffer they originally pointed at is gone.
pub struct DelegateArena {
    chunks: Mutex<Vec<Box<StableAddressVec<BufferDelegate>>>>,
}

impl std::fmt::Debug for DelegateArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chunks = self.chunks.lock().unwrap();
        let count: usize = chunks.iter().map(|c| c.len()).sum();
        f.debug_struct("DelegateArena")
            .field("delegate_count", &count)
            .finish()
    }
}

impl DelegateArena {
    pub fn new() -> Self {
        DelegateArena {
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a new delegate pointing directly at `buffer`.
    pub fn alloc(&self, buffer: Weak<Buffer>) -> &BufferDelegate {
        let delegate = BufferDelegate::new(buffer);
        let mut chunks = self.chunks.lock().unwrap();
        if chunks.last().is_none_or(|c| c.len() >= ARENA_CHUNK_CAPACITY) {
            chunks.push(Box::new(StableAddressVec::with_capactiy(
                ARENA_CHUNK_CAPACITY,
            )));
        }
        let chunk = chunks.last().expect("chunk just pushed if needed");
        let delegate_ref = chunk.push(delegate);
        // SAFETY: `chunk` is heap-allocated via `Box` and never removed or
        // reallocated while this arena lives, so extending the borrow past
        // this method's stack frame (to the arena's own lifetime) is sound.
        unsafe { &*(delegate_ref as *const BufferDelegate) }
    }
}

impl Default for DelegateArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    #[test]
    #[should_panic(expected = "already-linked")]
    fn link_is_write_once() {
        let arena = DelegateArena::new();
        let a = arena.alloc(Weak::<Buffer>::new());
        let b = arena.alloc(Weak::<Buffer>::new());
        let c = arena.alloc(Weak::<Buffer>::new());
        a.link(b, 0);
        a.link(c, 0);
    }

    #[test]
    fn offset_accumulates_across_chain() {
        let arena = DelegateArena::new();
        let a = arena.alloc(Weak::<Buffer>::new());
        let b = arena.alloc(Weak::<Buffer>::new());
        let c = arena.alloc(Weak::<Buffer>::new());
        b.link(c, 64);
        a.link(b, 16);
        assert_eq!(a.get_offset(), 80);
    }
}
