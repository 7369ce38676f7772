// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Recoverable errors crossing an external-collaborator boundary.
//!
//! Programmer-error conditions (linking an already-linked delegate, calling
//! [`crate::buffer::Buffer::get_backing_span`] on a guest-backed buffer, or
//! violating a "must be locked first" contract) are deliberately not
//! represented here: those abort via `panic!`/`assert!`, since they are
//! caller-contract violations rather than recoverable runtime conditions.

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoherencyError {
    /// The host graphics allocator failed to produce a backing buffer.
    #[error("host buffer allocation failed: {0}")]
    HostAllocation(String),
    /// `CreateMirror` failed to alias the guest pages with a host mapping.
    #[error("guest mirror creation failed: {0}")]
    MirrorCreation(String),
    /// The guest span is no longer valid for trapping (e.g. it was unmapped
    /// out from under the buffer).
    #[error("guest span is no longer mapped")]
    GuestSpanUnmapped,
}
