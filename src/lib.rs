/*! Guest-host buffer coherency core for a GPU emulation layer.

A [`Buffer`](buffer::Buffer) presents a guest application's CPU-visible
memory region as a GPU-backed buffer on the host, and keeps the two copies
consistent as guest CPU writes, GPU completion fences, and buffer migration
(via [`BufferDelegate`](delegate::BufferDelegate) /
[`BufferView`](view::BufferView)) all interleave.

Consisting of:

 * `buffer`: the coherency state machine, trap callbacks, and read/write API
 * `delegate` / `view`: the stable indirection that lets a buffer be rebuilt
   or merged without invalidating outstanding handles
 * `megabuffer`: the per-buffer cache that short-circuits inline GPU updates
 * `tag`: the re-entrant-by-context-tag exclusive lock the other modules
   build on

The host graphics allocator, the guest memory-protection facility, the
fence-cycle primitive, and the megabuffer ring allocator are all external
collaborators, referenced here only through the traits in `host`, `guest`,
`fence`, and `megabuffer::MegabufferAllocator`.
*/

mod stable_address_vec;

pub mod error;
pub mod tag;
pub mod fence;
pub mod host;
pub mod guest;
pub mod delegate;
pub mod view;
pub mod megabuffer;
pub mod buffer;

#[cfg(feature = "testing")]
pub mod testing;

pub use error::CoherencyError;
pub use buffer::{Buffer, BufferId, DirtyState, Immutability};
pub use delegate::{BufferDelegate, DelegateArena};
pub use view::BufferView;
pub use tag::ContextTag;
pub use megabuffer::{MegabufferConfig, MegabufferTable};
