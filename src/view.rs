// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! `BufferView` — a `(delegate, offset, size)` triple usable as if it were
//! an independent buffer, transparently following buffer migration (§4.3).
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::delegate::BufferDelegate;
use crate::tag::ContextTag;

struct ViewState {
    delegate: *const BufferDelegate,
    offset: u64,
}

// SAFETY: `delegate` always points into a `DelegateArena` chunk that outlives
// every `BufferView` built over it (§9); the pointer carries no thread
// affinity.
unsafe impl Send for ViewState {}
unsafe impl Sync for ViewState {}

/// A stable sub-range view into a buffer that may migrate underneath it.
///
/// `size` is fixed at construction; `(get_buffer(), get_offset())` may
/// change across calls as the manager relinks delegates, but is guaranteed
/// stable between a successful `lock()` and the matching `unlock()` (§8
/// invariant 4).
pub struct BufferView {
    state: Mutex<ViewState>,
    size: u64,
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView").field("size", &self.size).finish_non_exhaustive()
    }
}

impl BufferView {
    pub fn new(delegate: &BufferDelegate, offset: u64, size: u64) -> Self {
        BufferView {
            state: Mutex::new(ViewState {
                delegate: delegate as *const BufferDelegate,
                offset,
            }),
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The buffer this view currently resolves to, or `None` if it has been
    /// dropped.
    pub fn get_buffer(&self) -> Option<Arc<Buffer>> {
        let state = self.state.lock().unwrap();
        // SAFETY: see `ViewState`.
        unsafe { &*state.delegate }.get_buffer()
    }

    /// The offset this view currently resolves to within `get_buffer()`.
    pub fn get_offset(&self) -> u64 {
        let state = self.state.lock().unwrap();
        // SAFETY: see `ViewState`.
        state.offset + unsafe { &*state.delegate }.get_offset()
    }

    /// Flattens the delegate chain now that the view is known stable,
    /// folding the chain's accumulated offset into `offset` (§4.2
    /// `ResolveDelegate`).
    fn resolve_delegate(&self) {
        let mut state = self.state.lock().unwrap();
        // SAFETY: see `ViewState`.
        let (terminal, accumulated) = unsafe { &*state.delegate }.resolve_chain();
        state.delegate = terminal;
        state.offset += accumulated;
    }

    fn current_target(&self) -> Option<Arc<Buffer>> {
        let state = self.state.lock().unwrap();
        // SAFETY: see `ViewState`.
        unsafe { &*state.delegate }.get_buffer()
    }

    /// Blocks until the view's current underlying buffer is locked,
    /// retrying through the lock-then-recheck loop (§4.3) if the buffer
    /// migrates out from under an in-flight acquisition.
    pub fn lock(&self) -> Arc<Buffer> {
        loop {
            let Some(target1) = self.current_target() else {
                panic!("BufferView::lock called with no live underlying buffer");
            };
            target1.lock();
            let target2 = self.current_target();
            if target2.as_ref().is_some_and(|t| Arc::ptr_eq(t, &target1)) {
                self.resolve_delegate();
                return target1;
            }
            target1.unlock();
        }
    }

    /// Non-blocking variant of [`Self::lock`]; returns `None` immediately on
    /// contention rather than retrying (§4.3).
    pub fn try_lock(&self) -> Option<Arc<Buffer>> {
        let target1 = self.current_target()?;
        if !target1.try_lock() {
            return None;
        }
        let target2 = self.current_target();
        if target2.as_ref().is_some_and(|t| Arc::ptr_eq(t, &target1)) {
            self.resolve_delegate();
            Some(target1)
        } else {
            target1.unlock();
            None
        }
    }

    /// Re-entrant-by-tag variant (§4.3). Returns the acquired buffer and
    /// whether the lock was freshly acquired (`false` means `tag` already
    /// owned it).
    pub fn lock_with_tag(&self, tag: ContextTag) -> (Arc<Buffer>, bool) {
        loop {
            let Some(target1) = self.current_target() else {
                panic!("BufferView::lock_with_tag called with no live underlying buffer");
            };
            let freshly_acquired = target1.lock_with_tag(tag);
            let target2 = self.current_target();
            if target2.as_ref().is_some_and(|t| Arc::ptr_eq(t, &target1)) {
                self.resolve_delegate();
                return (target1, freshly_acquired);
            }
            if freshly_acquired {
                target1.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateArena;
    use crate::testing;

    #[test]
    fn view_over_unlinked_delegate_resolves_to_its_buffer() {
        let arena = DelegateArena::new();
        let buffer = testing::host_only_buffer(4096);
        let delegate = arena.alloc(Arc::downgrade(&buffer));
        let view = BufferView::new(delegate, 16, 32);
        assert!(Arc::ptr_eq(&view.get_buffer().unwrap(), &buffer));
        assert_eq!(view.get_offset(), 16);
        assert_eq!(view.size(), 32);
    }

    #[test]
    fn migration_is_observed_by_view_lock() {
        let arena = DelegateArena::new();
        let buffer_a = testing::host_only_buffer(4096);
        let buffer_b = testing::host_only_buffer(4096);
        let delegate_a = arena.alloc(Arc::downgrade(&buffer_a));
        let delegate_b = arena.alloc(Arc::downgrade(&buffer_b));

        let view = BufferView::new(delegate_a, 16, 32);
        delegate_a.link(delegate_b, 64);

        let locked = view.lock();
        assert!(Arc::ptr_eq(&locked, &buffer_b));
        assert_eq!(view.get_offset(), 16 + 64);
        locked.unlock();
    }
}
