// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The coherency state machine, trap callbacks, and read/write API (§4.1).
//!
//! A [`Buffer`] presents one contiguous guest memory region mirrored by one
//! host GPU-visible allocation, and keeps the two sides consistent across
//! CPU writes (caught via trap), GPU completion (via a [`FenceCycle`]), and
//! explicit calls like [`Buffer::mark_gpu_dirty`]/[`Buffer::write`].
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::ReentrantMutex;

use crate::delegate::BufferDelegate;
use crate::error::CoherencyError;
use crate::fence::{chain_cycle, FenceCycle};
use crate::guest::{
    GuestMemory, GuestSpan, MirrorSpan, PreemptCallback, ReadTrapCallback, TrapHandle, TrapMode,
    WriteTrapCallback,
};
use crate::host::{BackingHandle, HostAllocator};
use crate::megabuffer::{MegabufferAllocator, MegabufferBinding, MegabufferConfig, MegabufferTable};
use crate::tag::{ContextTag, TaggedLock};
use crate::view::BufferView;

const PAGE_SIZE: usize = 4096;

fn align_to_page(span: GuestSpan) -> GuestSpan {
    let aligned_start = span.address & !(PAGE_SIZE - 1);
    let end = span.address + span.len;
    let aligned_end = end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    GuestSpan::new(aligned_start, aligned_end - aligned_start)
}

/// Process-unique identity of a [`Buffer`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl BufferId {
    fn new() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which side last mutated the bytes and is thus the current source of
/// truth (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    Clean,
    CpuDirty,
    GpuDirty,
}

/// A per-context promise about CPU writes to `backing` (§3, §5).
///
/// Named `Unblocked` rather than the spec's bare "None" to avoid colliding
/// with [`Option::None`] at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immutability {
    Unblocked,
    SequencedWrites,
    AllWrites,
}

/// Guest-span-relative view into the (possibly page-aligned-superset)
/// mirror mapping (§3: `mirror` vs `alignedMirror`).
///
/// `CreateMirror` is handed the page-aligned span, so the returned
/// [`MirrorSpan`] may start earlier than `guest_span.address`; every
/// offset the public API accepts is relative to the guest span itself, so
/// callers never need to reason about alignment padding.
fn mirror_slice<'a>(mirror: &'a MirrorSpan, guest_span: GuestSpan, aligned: GuestSpan) -> &'a [u8] {
    let start = guest_span.address - aligned.address;
    &mirror.as_slice()[start..start + guest_span.len]
}

fn mirror_slice_mut<'a>(mirror: &'a MirrorSpan, guest_span: GuestSpan, aligned: GuestSpan) -> &'a mut [u8] {
    let start = guest_span.address - aligned.address;
    &mut mirror.as_mut_slice()[start..start + guest_span.len]
}

struct StateInner {
    dirty: DirtyState,
    immutability: Immutability,
    cycle: Option<Arc<dyn FenceCycle>>,
    sequence_number: u64,
    ever_had_inline_update: bool,
}

/// One contiguous guest memory region mirrored by one host GPU-visible
/// allocation (§3).
pub struct Buffer {
    id: BufferId,
    backing: BackingHandle,
    guest_span: Option<GuestSpan>,
    /// The page-aligned superset of `guest_span` that `mirror` actually
    /// maps (§3 `alignedMirror`). `None` for host-only buffers.
    aligned_span: Option<GuestSpan>,
    mirror: Option<MirrorSpan>,
    guest_memory: Option<Arc<dyn GuestMemory>>,
    trap: Mutex<Option<TrapHandle>>,
    mutex: TaggedLock,
    state: ReentrantMutex<RefCell<StateInner>>,
    megabuffer: Mutex<Option<MegabufferTable>>,
    megabuffer_config: MegabufferConfig,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let inner = state.borrow();
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("guest_backed", &self.guest_span.is_some())
            .field("dirty", &inner.dirty)
            .field("immutability", &inner.immutability)
            .field("sequence_number", &inner.sequence_number)
            .finish()
    }
}

impl Buffer {
    fn new(
        backing: BackingHandle,
        guest_span: Option<GuestSpan>,
        aligned_span: Option<GuestSpan>,
        mirror: Option<MirrorSpan>,
        guest_memory: Option<Arc<dyn GuestMemory>>,
        megabuffer_config: MegabufferConfig,
    ) -> Arc<Buffer> {
        Arc::new(Buffer {
            id: BufferId::new(),
            backing,
            guest_span,
            aligned_span,
            mirror,
            guest_memory,
            trap: Mutex::new(None),
            mutex: TaggedLock::new(),
            state: ReentrantMutex::new(RefCell::new(StateInner {
                dirty: DirtyState::Clean,
                immutability: Immutability::Unblocked,
                cycle: None,
                sequence_number: 1,
                ever_had_inline_update: false,
            })),
            megabuffer: Mutex::new(None),
            megabuffer_config,
        })
    }

    /// Creates a host-only buffer: permanently `Clean`, no trap, no mirror
    /// (§3 invariant 1).
    pub fn new_host_only(
        size: usize,
        host_allocator: &dyn HostAllocator,
        megabuffer_config: MegabufferConfig,
    ) -> Result<Arc<Buffer>, CoherencyError> {
        let backing = host_allocator.allocate_buffer(size)?;
        Ok(Self::new(backing, None, None, None, None, megabuffer_config))
    }

    /// Creates a guest-backed buffer mirroring `guest_span`. The trap is
    /// *not* installed by this constructor — call
    /// [`Buffer::setup_guest_mappings`] once the buffer is held in an `Arc`,
    /// since the trap callbacks capture a weak self-reference (§3
    /// Lifecycle).
    pub fn new_guest_backed(
        guest_span: GuestSpan,
        host_allocator: &dyn HostAllocator,
        guest_memory: Arc<dyn GuestMemory>,
        megabuffer_config: MegabufferConfig,
    ) -> Result<Arc<Buffer>, CoherencyError> {
        let backing = host_allocator.allocate_buffer(guest_span.len)?;
        let aligned = align_to_page(guest_span);
        let mirror = guest_memory.create_mirror(aligned)?;
        Ok(Self::new(
            backing,
            Some(guest_span),
            Some(aligned),
            Some(mirror),
            Some(guest_memory),
            megabuffer_config,
        ))
    }

    /// Installs the page-fault trap over this buffer's guest span. A no-op
    /// for host-only buffers.
    pub fn setup_guest_mappings(self: &Arc<Self>) -> Result<(), CoherencyError> {
        let Some(guest_memory) = self.guest_memory.clone() else {
            return Ok(());
        };
        let span = self
            .guest_span
            .expect("guest_memory is only set on guest-backed buffers");

        let weak_preempt = Arc::downgrade(self);
        let preempt: PreemptCallback = Box::new(move || {
            if let Some(buffer) = weak_preempt.upgrade() {
                buffer.on_preempt();
            }
        });

        let weak_read = Arc::downgrade(self);
        let read_trap: ReadTrapCallback = Box::new(move || match weak_read.upgrade() {
            Some(buffer) => buffer.on_read_trap(),
            None => false,
        });

        let weak_write = Arc::downgrade(self);
        let write_trap: WriteTrapCallback = Box::new(move || match weak_write.upgrade() {
            Some(buffer) => buffer.on_write_trap(),
            None => false,
        });

        let handle = guest_memory.create_trap(span, preempt, read_trap, write_trap)?;
        *self.trap.lock().unwrap() = Some(handle);
        guest_memory.trap_regions(handle, TrapMode::ReadWrite);
        Ok(())
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn is_guest_backed(&self) -> bool {
        self.guest_span.is_some()
    }

    /// The installed trap handle, if any. Exposed alongside the other
    /// debug/introspection accessors (§11) so a test harness can drive the
    /// guest memory facility's trap callbacks directly.
    pub fn trap_handle(&self) -> Option<TrapHandle> {
        *self.trap.lock().unwrap()
    }

    // ---- introspection (§10/§11 debug surface) ----

    pub fn dirty_state(&self) -> DirtyState {
        self.state.lock().borrow().dirty
    }

    pub fn backing_immutability(&self) -> Immutability {
        self.state.lock().borrow().immutability
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.lock().borrow().sequence_number
    }

    pub fn ever_had_inline_update(&self) -> bool {
        self.state.lock().borrow().ever_had_inline_update
    }

    // ---- locking (§5) ----

    /// Blocks until the exclusive buffer lock is acquired.
    pub fn lock(&self) {
        self.mutex.lock();
    }

    /// Non-blocking variant; returns `false` immediately on contention.
    pub fn try_lock(&self) -> bool {
        self.mutex.try_lock()
    }

    /// Re-entrant-by-tag variant. Returns whether the lock was freshly
    /// acquired (§8 R3: a repeat call with the same tag returns `false`).
    pub fn lock_with_tag(&self, tag: ContextTag) -> bool {
        self.mutex.lock_with_tag(tag)
    }

    /// Releases the lock and resets `backingImmutability` to `Unblocked`
    /// (§3 invariant 5 — immutability is strictly per-context).
    pub fn unlock(&self) {
        self.mutex.unlock();
        self.state.lock().borrow_mut().immutability = Immutability::Unblocked;
    }

    // ---- immutability (§5) ----

    /// Upgrades `Unblocked -> SequencedWrites`; never downgrades from
    /// `AllWrites`. Valid only while locked (caller contract, §5).
    pub fn block_sequenced_cpu_backing_writes(&self) {
        let state = self.state.lock();
        let mut inner = state.borrow_mut();
        if inner.immutability == Immutability::Unblocked {
            inner.immutability = Immutability::SequencedWrites;
        }
    }

    /// Forces `AllWrites`. Valid only while locked (caller contract, §5).
    pub fn block_all_cpu_backing_writes(&self) {
        self.state.lock().borrow_mut().immutability = Immutability::AllWrites;
    }

    pub fn sequenced_cpu_backing_writes_blocked(&self) -> bool {
        !matches!(self.backing_immutability(), Immutability::Unblocked)
    }

    pub fn all_cpu_backing_writes_blocked(&self) -> bool {
        matches!(self.backing_immutability(), Immutability::AllWrites)
    }

    /// Alias for [`Self::sequenced_cpu_backing_writes_blocked`] (§6).
    pub fn requires_cycle_attach(&self) -> bool {
        self.sequenced_cpu_backing_writes_blocked()
    }

    // ---- fence (§5, §6) ----

    pub fn wait_on_fence(&self) {
        let cycle = self.state.lock().borrow().cycle.clone();
        if let Some(cycle) = cycle {
            let _perf = logwise::perfwarn_begin!("buffer wait_on_fence");
            cycle.wait();
        }
    }

    /// `true` means no in-flight GPU use (no cycle, or the cycle has
    /// signaled).
    pub fn poll_fence(&self) -> bool {
        self.state
            .lock()
            .borrow()
            .cycle
            .as_ref()
            .is_none_or(|c| c.poll())
    }

    /// Chains `new_cycle` behind any already-outstanding cycle (§6
    /// `ChainCycle`).
    pub fn update_cycle(&self, new_cycle: Arc<dyn FenceCycle>) {
        let state = self.state.lock();
        let mut inner = state.borrow_mut();
        let chained = chain_cycle(inner.cycle.take(), new_cycle);
        inner.cycle = Some(chained);
    }

    // ---- sequencing (§3, §6) ----

    pub fn advance_sequence(&self) -> u64 {
        let state = self.state.lock();
        let mut inner = state.borrow_mut();
        inner.sequence_number += 1;
        inner.sequence_number
    }

    /// Forces every cached megabuffer entry to be treated as stale, without
    /// otherwise touching `dirtyState` or `backing`.
    ///
    /// §6 lists `Invalidate` alongside `AdvanceSequence` without further
    /// elaboration; this crate resolves the ambiguity by having it drop the
    /// buffer's megabuffer table outright (see `DESIGN.md`), which is
    /// stronger than the implicit invalidation a bumped sequence number
    /// already gives cached entries.
    pub fn invalidate(&self) {
        self.advance_sequence();
        *self.megabuffer.lock().unwrap() = None;
    }

    pub fn acquire_current_sequence(&self) -> (u64, &[u8]) {
        let _state_guard = self.state.lock();
        if self.dirty_state() == DirtyState::GpuDirty && !self.synchronize_guest(false, true) {
            return (0, &[]);
        }
        let seq = self.sequence_number();
        let mirror = match (&self.mirror, self.guest_span, self.aligned_span) {
            (Some(m), Some(guest_span), Some(aligned)) => mirror_slice(m, guest_span, aligned),
            _ => &[],
        };
        (seq, mirror)
    }

    // ---- synchronization (§4.1) ----

    /// `CpuDirty -> Clean`: no-op otherwise.
    pub fn synchronize_host(&self, skip_trap: bool) {
        let state = self.state.lock();
        if state.borrow().dirty != DirtyState::CpuDirty {
            return;
        }
        let cycle = state.borrow().cycle.clone();
        if let Some(cycle) = cycle {
            cycle.wait();
        }
        state.borrow_mut().sequence_number += 1;
        if !skip_trap {
            if let (Some(guest_memory), Some(trap)) = (&self.guest_memory, *self.trap.lock().unwrap()) {
                guest_memory.trap_regions(trap, TrapMode::WriteOnly);
            }
        }
        if let (Some(mirror), Some(guest_span), Some(aligned)) =
            (&self.mirror, self.guest_span, self.aligned_span)
        {
            // SAFETY: `stateMutex` serializes every coherency transition;
            // no other writer touches `backing` while CpuDirty is resolving.
            unsafe { self.backing.as_mut_slice() }
                .copy_from_slice(mirror_slice(mirror, guest_span, aligned));
        }
        state.borrow_mut().dirty = DirtyState::Clean;
        logwise::trace_sync!("synchronize_host: CpuDirty -> Clean");
    }

    /// `GpuDirty -> Clean`. Returns `false` if there is no guest backing,
    /// if `non_blocking` and the cycle has not signaled yet, and `true`
    /// otherwise (including the already-`Clean`/`CpuDirty` no-op case).
    pub fn synchronize_guest(&self, skip_trap: bool, non_blocking: bool) -> bool {
        if self.guest_span.is_none() {
            return false;
        }
        let state = self.state.lock();
        if state.borrow().dirty != DirtyState::GpuDirty {
            return true;
        }
        if non_blocking {
            let signaled = state.borrow().cycle.as_ref().is_none_or(|c| c.poll());
            if !signaled {
                return false;
            }
        } else {
            let cycle = state.borrow().cycle.clone();
            if let Some(cycle) = cycle {
                cycle.wait();
            }
        }
        if let (Some(mirror), Some(guest_span), Some(aligned)) =
            (&self.mirror, self.guest_span, self.aligned_span)
        {
            mirror_slice_mut(mirror, guest_span, aligned)
                .copy_from_slice(unsafe { self.backing.as_slice() });
        }
        state.borrow_mut().dirty = DirtyState::Clean;
        if !skip_trap {
            if let (Some(guest_memory), Some(trap)) = (&self.guest_memory, *self.trap.lock().unwrap()) {
                guest_memory.trap_regions(trap, TrapMode::ReadWrite);
            }
        }
        logwise::trace_sync!("synchronize_guest: GpuDirty -> Clean");
        true
    }

    /// Flushes pending GPU work via `flush_host_callback` first if this
    /// context was not the first to touch the resource this execution, then
    /// delegates to [`Self::synchronize_guest`] (§4.1).
    pub fn synchronize_guest_immediate(
        &self,
        is_first_usage: bool,
        flush_host_callback: &dyn Fn(),
    ) -> bool {
        if !is_first_usage {
            let _perf = logwise::perfwarn_begin!("buffer synchronize_guest_immediate flush");
            flush_host_callback();
        }
        self.synchronize_guest(false, false)
    }

    /// Guest-backed only. Disarms write-trap re-arming for the implicit
    /// host sync, transitions to `GpuDirty`, pages the guest out, and
    /// enters `AllWrites` immutability (§4.1).
    pub fn mark_gpu_dirty(&self) {
        assert!(
            self.guest_span.is_some(),
            "mark_gpu_dirty requires a guest-backed buffer"
        );
        let state = self.state.lock();
        let currently_cpu_dirty = state.borrow().dirty == DirtyState::CpuDirty;
        if currently_cpu_dirty {
            // Reentrant: synchronize_host re-acquires `state` on this same
            // thread, which parking_lot::ReentrantMutex permits.
            self.synchronize_host(true);
        }
        {
            let mut inner = state.borrow_mut();
            inner.dirty = DirtyState::GpuDirty;
            inner.immutability = Immutability::AllWrites;
            inner.sequence_number += 1;
        }
        drop(state);
        if let (Some(guest_memory), Some(trap)) = (&self.guest_memory, *self.trap.lock().unwrap()) {
            guest_memory.page_out_regions(trap);
        }
        logwise::trace_sync!("mark_gpu_dirty: Clean/CpuDirty -> GpuDirty");
    }

    // ---- read/write (§4.1) ----

    pub fn read(&self, is_first_usage: bool, flush_host_callback: &dyn Fn(), out: &mut [u8], offset: usize) {
        let _state_guard = self.state.lock();
        if self.dirty_state() == DirtyState::GpuDirty {
            self.synchronize_guest_immediate(is_first_usage, flush_host_callback);
        }
        let mirror = self
            .mirror
            .as_ref()
            .expect("read requires a guest-backed buffer");
        let slice = mirror_slice(mirror, self.guest_span.unwrap(), self.aligned_span.unwrap());
        out.copy_from_slice(&slice[offset..offset + out.len()]);
    }

    /// Returns `true` to request the caller retry with a GPU-copy callback
    /// (§4.1 step 6, §7).
    pub fn write(
        &self,
        is_first_usage: bool,
        flush_host_callback: &dyn Fn(),
        data: &[u8],
        offset: usize,
        gpu_copy_callback: Option<&dyn Fn()>,
    ) -> bool {
        let mirror = self
            .mirror
            .as_ref()
            .expect("write requires a guest-backed buffer");
        let guest_span = self.guest_span.unwrap();
        let aligned_span = self.aligned_span.unwrap();
        let state_guard = self.state.lock();

        state_guard.borrow_mut().sequence_number += 1;
        state_guard.borrow_mut().ever_had_inline_update = true;

        if self.dirty_state() == DirtyState::GpuDirty {
            self.synchronize_guest_immediate(is_first_usage, flush_host_callback);
        }

        let sequenced_blocked = self.sequenced_cpu_backing_writes_blocked();
        if self.dirty_state() == DirtyState::CpuDirty && sequenced_blocked {
            self.synchronize_host(false);
        }

        mirror_slice_mut(mirror, guest_span, aligned_span)[offset..offset + data.len()]
            .copy_from_slice(data);

        if self.dirty_state() == DirtyState::CpuDirty && !sequenced_blocked {
            return false;
        }

        if !sequenced_blocked && self.poll_fence() {
            // SAFETY: no outstanding GPU use of `backing` (poll_fence was
            // true) and we are not sequence-blocked, so a direct CPU write
            // to `backing` is permitted (§5).
            unsafe { self.backing.as_mut_slice() }[offset..offset + data.len()].copy_from_slice(data);
            return false;
        }

        match gpu_copy_callback {
            Some(callback) => {
                callback();
                false
            }
            None => {
                logwise::warn_sync!("write: GPU-side inline update required, no callback provided");
                true
            }
        }
    }

    /// Returns the mirror span (guest-backed) or the backing span
    /// (host-only), applying the same sync discipline as `read` (§4.1).
    pub fn get_read_only_backing_span(
        &self,
        is_first_usage: bool,
        flush_host_callback: &dyn Fn(),
    ) -> &[u8] {
        let _state_guard = self.state.lock();
        if self.dirty_state() == DirtyState::GpuDirty {
            self.synchronize_guest_immediate(is_first_usage, flush_host_callback);
        }
        match (&self.mirror, self.guest_span, self.aligned_span) {
            (Some(mirror), Some(guest_span), Some(aligned)) => {
                mirror_slice(mirror, guest_span, aligned)
            }
            _ => unsafe { self.backing.as_slice() },
        }
    }

    /// Direct, unsynchronized access to the backing allocation. Only valid
    /// for host-only buffers — calling this on a guest-backed buffer is a
    /// programmer error (§7), since guest-backed buffers deliberately never
    /// expose GPU-owned storage directly.
    pub fn get_backing_span(&self) -> &[u8] {
        assert!(
            self.guest_span.is_none(),
            "get_backing_span is only valid for host-only buffers"
        );
        unsafe { self.backing.as_slice() }
    }

    // ---- views (§4.2, §4.3) ----

    /// Constructs a view over `[offset, offset + size)` via `delegate`,
    /// which the buffer manager is responsible for allocating and linking
    /// (delegate lifetime is owned by the manager, not the buffer — §9).
    /// Panics if the range exceeds the buffer.
    pub fn get_view(&self, delegate: &BufferDelegate, offset: u64, size: u64) -> BufferView {
        self.try_get_view(delegate, offset, size)
            .expect("requested view range exceeds buffer bounds")
    }

    /// Fallible variant: returns `None` if `[offset, offset + size)` is not
    /// contained within this buffer (§8 boundary behaviors).
    pub fn try_get_view(&self, delegate: &BufferDelegate, offset: u64, size: u64) -> Option<BufferView> {
        let total_len = self
            .guest_span
            .map(|s| s.len as u64)
            .unwrap_or(self.backing.len() as u64);
        if offset.checked_add(size)? > total_len {
            return None;
        }
        Some(BufferView::new(delegate, offset, size))
    }

    // ---- megabuffer (§4.4) ----

    pub fn try_megabuffer_view(
        &self,
        allocator: &dyn MegabufferAllocator,
        cycle: Arc<dyn FenceCycle>,
        execution_number: u64,
        offset: u64,
        size: u64,
    ) -> Option<MegabufferBinding> {
        if !self.synchronize_guest(false, true) {
            return None;
        }
        let mirror = self.mirror.as_ref()?;
        let slice = mirror_slice(mirror, self.guest_span?, self.aligned_span?);
        let mut table_guard = self.megabuffer.lock().unwrap();
        if table_guard.is_none() {
            *table_guard = Some(MegabufferTable::new(slice.len(), self.megabuffer_config));
        }
        table_guard.as_ref().unwrap().try_view(
            allocator,
            cycle,
            slice,
            self.ever_had_inline_update(),
            self.sequence_number(),
            execution_number,
            offset,
            size,
        )
    }

    // ---- trap callbacks (§4.1, §9) ----

    fn on_preempt(&self) {
        if self.all_cpu_backing_writes_blocked() {
            // Stalls the guest thread until the GPU releases the backing;
            // this is a transient barrier, not a real context taking
            // ownership, so it bypasses `Buffer::unlock`'s immutability
            // reset and goes straight through the raw lock.
            self.mutex.lock();
            self.mutex.unlock();
        }
    }

    fn on_read_trap(&self) -> bool {
        let Some(state_guard) = self.state.try_lock() else {
            return false;
        };
        if state_guard.borrow().dirty != DirtyState::GpuDirty {
            return true;
        }
        drop(state_guard);
        if !self.mutex.try_lock() {
            return false;
        }
        let handled = self.synchronize_guest(true, false);
        self.mutex.unlock();
        handled
    }

    fn on_write_trap(&self) -> bool {
        let Some(state_guard) = self.state.try_lock() else {
            return false;
        };
        let all_blocked = state_guard.borrow().immutability == Immutability::AllWrites;
        let gpu_dirty = state_guard.borrow().dirty == DirtyState::GpuDirty;
        if !all_blocked && !gpu_dirty {
            state_guard.borrow_mut().dirty = DirtyState::CpuDirty;
            return true;
        }
        drop(state_guard);
        if !self.mutex.try_lock() {
            return false;
        }
        self.wait_on_fence();
        self.synchronize_guest(true, false);
        self.state.lock().borrow_mut().dirty = DirtyState::CpuDirty;
        self.mutex.unlock();
        true
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // §3 Lifecycle: delete the trap, final SynchronizeGuest(skipTrap),
        // await the outstanding fence. The external interfaces in §6 give
        // no mirror-unmap operation, so unmapping is left to whatever owns
        // the `MirrorSpan`'s backing pages (see DESIGN.md).
        if let (Some(guest_memory), Some(trap)) =
            (&self.guest_memory, self.trap.lock().unwrap().take())
        {
            guest_memory.delete_trap(trap);
        }
        self.synchronize_guest(true, false);
        self.wait_on_fence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn host_only_buffer_is_always_clean() {
        let buffer = testing::host_only_buffer(4096);
        assert_eq!(buffer.dirty_state(), DirtyState::Clean);
        assert!(!buffer.is_guest_backed());
    }

    #[test]
    fn cpu_only_round_trip() {
        let buffer = testing::guest_backed_buffer(4096);
        let retry = buffer.write(true, &|| {}, &[0xAAu8; 256], 0, None);
        assert!(!retry);
        let mut out = [0u8; 256];
        buffer.read(true, &|| {}, &mut out, 0);
        assert_eq!(out, [0xAAu8; 256]);
        assert_eq!(buffer.sequence_number(), 2);
    }

    #[test]
    fn mark_gpu_dirty_then_synchronize_guest_returns_to_clean() {
        let buffer = testing::guest_backed_buffer(4096);
        buffer.mark_gpu_dirty();
        assert_eq!(buffer.dirty_state(), DirtyState::GpuDirty);
        assert!(buffer.synchronize_guest(false, false));
        assert_eq!(buffer.dirty_state(), DirtyState::Clean);
    }

    #[test]
    fn lock_with_tag_reentry_is_a_single_unlock() {
        let buffer = testing::host_only_buffer(4096);
        let tag = ContextTag::new();
        assert!(buffer.lock_with_tag(tag));
        assert!(!buffer.lock_with_tag(tag));
        buffer.unlock();
        assert!(buffer.try_lock());
        buffer.unlock();
    }

    #[test]
    fn synchronize_host_on_clean_buffer_is_a_noop() {
        let buffer = testing::guest_backed_buffer(4096);
        let before = buffer.sequence_number();
        buffer.synchronize_host(false);
        assert_eq!(buffer.sequence_number(), before);
    }

    #[test]
    fn write_blocked_without_callback_requests_retry() {
        let buffer = testing::guest_backed_buffer(4096);
        buffer.lock();
        buffer.block_all_cpu_backing_writes();
        let retry = buffer.write(true, &|| {}, &[1, 2, 3, 4], 0, None);
        assert!(retry);
        buffer.unlock();
    }

    #[test]
    fn write_blocked_with_callback_invokes_it_once() {
        let buffer = testing::guest_backed_buffer(4096);
        buffer.lock();
        buffer.block_all_cpu_backing_writes();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let retry = buffer.write(
            true,
            &|| {},
            &[1, 2, 3, 4],
            0,
            Some(&|| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        assert!(!retry);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        buffer.unlock();
    }

    #[test]
    fn try_get_view_out_of_bounds_is_none() {
        let arena = crate::delegate::DelegateArena::new();
        let buffer = testing::host_only_buffer(4096);
        let delegate = arena.alloc(Arc::downgrade(&buffer));
        assert!(buffer.try_get_view(delegate, 4000, 200).is_none());
        assert!(buffer.try_get_view(delegate, 0, 4096).is_some());
    }
}
