// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The CPU memory-protection facility boundary (§6): mirror creation and the
//! page-fault trap callbacks guest CPU writes arrive through.
use crate::error::CoherencyError;

/// A contiguous span of guest-physical-backed memory, as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSpan {
    pub address: usize,
    pub len: usize,
}

impl GuestSpan {
    pub fn new(address: usize, len: usize) -> Self {
        GuestSpan { address, len }
    }

    pub fn contains(&self, other: GuestSpan) -> bool {
        other.address >= self.address
            && other
                .address
                .checked_add(other.len)
                .is_some_and(|end| end <= self.address + self.len)
    }
}

/// A host virtual-address mapping aliasing the same physical pages as a
/// [`GuestSpan`] — the mirror (§3).
pub struct MirrorSpan {
    data: *mut u8,
    len: usize,
}

// SAFETY: the mapping aliases guest-owned physical pages for the lifetime
// of the owning `Buffer`; access is serialized by the coherency core's own
// locks, not by any thread affinity of the mapping itself.
unsafe impl Send for MirrorSpan {}
unsafe impl Sync for MirrorSpan {}

impl std::fmt::Debug for MirrorSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSpan")
            .field("data", &self.data)
            .field("len", &self.len)
            .finish()
    }
}

impl MirrorSpan {
    /// # Safety
    /// `data` must be valid for reads and writes of `len` bytes for as long
    /// as this mapping lives.
    pub unsafe fn new(data: *mut u8, len: usize) -> Self {
        MirrorSpan { data, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

/// Opaque handle to an installed trap (§6 `CreateTrap`/`DeleteTrap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapHandle(pub u64);

/// Whether `TrapRegions` should arm write protection only, or both read and
/// write protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapMode {
    WriteOnly,
    ReadWrite,
}

/// The preempt callback (§4.1): invoked synchronously before the guest
/// thread is allowed to mutate trapped memory.
pub type PreemptCallback = Box<dyn Fn() + Send + Sync>;
/// The read-trap callback. Returns `true` if handled, `false` to retry.
pub type ReadTrapCallback = Box<dyn Fn() -> bool + Send + Sync>;
/// The write-trap callback. Returns `true` if handled, `false` to retry.
pub type WriteTrapCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// The CPU memory-protection facility (NCE, in the emulator's own
/// terminology) — an external collaborator referenced only by interface.
pub trait GuestMemory: std::fmt::Debug + Send + Sync {
    /// Returns a host mapping aliasing the same physical pages as `span`.
    ///
    /// `span` must already be page-aligned; the coherency core computes
    /// `alignedMirror` (§3) before calling this.
    fn create_mirror(&self, span: GuestSpan) -> Result<MirrorSpan, CoherencyError>;

    /// Installs the three trap callbacks over `span`.
    fn create_trap(
        &self,
        span: GuestSpan,
        preempt: PreemptCallback,
        read_trap: ReadTrapCallback,
        write_trap: WriteTrapCallback,
    ) -> Result<TrapHandle, CoherencyError>;

    /// (Re)arms protection for the given trap.
    fn trap_regions(&self, handle: TrapHandle, mode: TrapMode);

    /// Releases the guest physical pages backing `handle`'s span.
    fn page_out_regions(&self, handle: TrapHandle);

    /// Removes protection and callbacks.
    fn delete_trap(&self, handle: TrapHandle);
}
