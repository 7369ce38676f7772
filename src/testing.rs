// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! In-memory stand-ins for the external collaborators (§10.4), mirroring
//! the teacher's `imp::nop` / `View::for_testing()` pattern: enough to
//! exercise every coherency transition without a real GPU or page-fault
//! hardware behind it.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::error::CoherencyError;
use crate::fence::FenceCycle;
use crate::guest::{
    GuestMemory, GuestSpan, MirrorSpan, PreemptCallback, ReadTrapCallback, TrapHandle, TrapMode,
    WriteTrapCallback,
};
use crate::host::{BackingHandle, HostAllocator};
use crate::megabuffer::{MegabufferAllocation, MegabufferAllocator, MegabufferConfig};

/// A fence cycle that is always already signaled.
#[derive(Debug)]
pub struct NopFenceCycle;

impl FenceCycle for NopFenceCycle {
    fn wait(&self) {}
    fn poll(&self) -> bool {
        true
    }
}

/// Allocates plain heap memory and calls it GPU-visible.
#[derive(Debug, Default)]
pub struct NopHostAllocator;

impl HostAllocator for NopHostAllocator {
    fn allocate_buffer(&self, size: usize) -> Result<BackingHandle, CoherencyError> {
        let mut storage: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let data = storage.as_mut_ptr();
        let len = storage.len();
        Ok(unsafe { BackingHandle::new(data, len, storage) })
    }
}

struct InstalledTrap {
    preempt: PreemptCallback,
    read_trap: ReadTrapCallback,
    write_trap: WriteTrapCallback,
}

/// A guest memory facility with no real guest CPU behind it: `create_mirror`
/// fabricates fresh zeroed storage (leaked for the process's life, since
/// there is no real guest page table to release it back to — acceptable
/// for a test-only fixture). Trap callbacks are stored rather than wired to
/// real page-fault hardware; tests fire them explicitly via
/// [`NopGuestMemory::invoke_write_trap`] / [`NopGuestMemory::invoke_read_trap`]
/// / [`NopGuestMemory::invoke_preempt`] to simulate a guest CPU access.
#[derive(Default)]
pub struct NopGuestMemory {
    next_trap: AtomicU64,
    traps: Mutex<HashMap<u64, InstalledTrap>>,
}

impl std::fmt::Debug for NopGuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NopGuestMemory").finish_non_exhaustive()
    }
}

impl GuestMemory for NopGuestMemory {
    fn create_mirror(&self, span: GuestSpan) -> Result<MirrorSpan, CoherencyError> {
        let mut storage: Box<[u8]> = vec![0u8; span.len].into_boxed_slice();
        let data = storage.as_mut_ptr();
        let len = storage.len();
        std::mem::forget(storage);
        Ok(unsafe { MirrorSpan::new(data, len) })
    }

    fn create_trap(
        &self,
        _span: GuestSpan,
        preempt: PreemptCallback,
        read_trap: ReadTrapCallback,
        write_trap: WriteTrapCallback,
    ) -> Result<TrapHandle, CoherencyError> {
        let id = self.next_trap.fetch_add(1, Ordering::Relaxed);
        self.traps.lock().unwrap().insert(
            id,
            InstalledTrap {
                preempt,
                read_trap,
                write_trap,
            },
        );
        Ok(TrapHandle(id))
    }

    fn trap_regions(&self, _handle: TrapHandle, _mode: TrapMode) {}
    fn page_out_regions(&self, _handle: TrapHandle) {}
    fn delete_trap(&self, handle: TrapHandle) {
        self.traps.lock().unwrap().remove(&handle.0);
    }
}

impl NopGuestMemory {
    /// Simulates a guest write fault: invokes the stored write-trap
    /// callback, returning `true` if handled, `false` if the trap facility
    /// should retry (§4.1).
    pub fn invoke_write_trap(&self, handle: TrapHandle) -> bool {
        let traps = self.traps.lock().unwrap();
        (traps[&handle.0].write_trap)()
    }

    /// Simulates a guest read fault.
    pub fn invoke_read_trap(&self, handle: TrapHandle) -> bool {
        let traps = self.traps.lock().unwrap();
        (traps[&handle.0].read_trap)()
    }

    /// Simulates the preempt callback firing before a guest mutation.
    pub fn invoke_preempt(&self, handle: TrapHandle) {
        let traps = self.traps.lock().unwrap();
        (traps[&handle.0].preempt)()
    }
}

/// Stages mirror slices into plain heap buffers instead of a real upload
/// ring.
#[derive(Debug, Default)]
pub struct NopMegabufferAllocator;

impl MegabufferAllocator for NopMegabufferAllocator {
    fn push(
        &self,
        _cycle: Arc<dyn FenceCycle>,
        mirror_slice: &[u8],
        _cacheable: bool,
    ) -> Result<MegabufferAllocation, CoherencyError> {
        Ok(MegabufferAllocation {
            buffer: Arc::new(mirror_slice.to_vec()) as Arc<dyn Any + Send + Sync>,
            offset: 0,
            region_size: mirror_slice.len() as u64,
        })
    }
}

/// Builds a host-only buffer backed by [`NopHostAllocator`].
pub fn host_only_buffer(size: usize) -> Arc<Buffer> {
    Buffer::new_host_only(size, &NopHostAllocator, MegabufferConfig::default())
        .expect("NopHostAllocator never fails")
}

/// Builds a guest-backed buffer with its trap already installed.
pub fn guest_backed_buffer(size: usize) -> Arc<Buffer> {
    guest_backed_buffer_with_memory(size).0
}

/// Like [`guest_backed_buffer`], but also returns the concrete
/// [`NopGuestMemory`] so a test can fire trap callbacks directly.
pub fn guest_backed_buffer_with_memory(size: usize) -> (Arc<Buffer>, Arc<NopGuestMemory>) {
    let guest_memory = Arc::new(NopGuestMemory::default());
    let buffer = Buffer::new_guest_backed(
        GuestSpan::new(0, size),
        &NopHostAllocator,
        guest_memory.clone(),
        MegabufferConfig::default(),
    )
    .expect("Nop collaborators never fail");
    buffer
        .setup_guest_mappings()
        .expect("NopGuestMemory never fails");
    (buffer, guest_memory)
}
