// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Integration coverage for the six concrete end-to-end scenarios.
//!
//! Runs against real OS threads rather than an async executor: trap
//! callbacks are contractually synchronous and run on the faulting guest
//! thread under signal-like constraints, so the test harness exercises the
//! same concurrency primitives production code will.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use buffer_coherency::testing::{self, NopFenceCycle, NopMegabufferAllocator};
use buffer_coherency::{ContextTag, DelegateArena, DirtyState};

#[test]
fn cpu_only_round_trip() {
    let buffer = testing::guest_backed_buffer(4096);
    let retry = buffer.write(true, &|| {}, &[0xAAu8; 256], 0, None);
    assert!(!retry);

    let mut out = [0u8; 256];
    buffer.read(true, &|| {}, &mut out, 0);
    assert_eq!(out, [0xAAu8; 256]);
    // One write advances the sequence exactly once, from 1 to 2.
    assert_eq!(buffer.sequence_number(), 2);
}

#[test]
fn gpu_dirty_cycle_flushes_host_exactly_once() {
    let buffer = testing::guest_backed_buffer(256);
    // Lands in both mirror and backing: PollFence is always true for the
    // nop fence cycle, so this inline write takes the direct-to-backing
    // path (§4.1 step 5), giving us a known backing snapshot.
    let retry = buffer.write(true, &|| {}, &[0x11u8; 64], 0, None);
    assert!(!retry);

    buffer.mark_gpu_dirty();
    assert_eq!(buffer.dirty_state(), DirtyState::GpuDirty);

    let flush_calls = AtomicUsize::new(0);
    let mut out = [0u8; 64];
    buffer.read(
        false,
        &|| {
            flush_calls.fetch_add(1, Ordering::SeqCst);
        },
        &mut out,
        0,
    );

    assert_eq!(flush_calls.load(Ordering::SeqCst), 1);
    assert_eq!(buffer.dirty_state(), DirtyState::Clean);
    assert_eq!(out, [0x11u8; 64]);
}

#[test]
fn write_trap_retries_while_buffer_is_locked() {
    let (buffer, guest_memory) = testing::guest_backed_buffer_with_memory(4096);
    let handle = buffer.trap_handle().expect("trap installed by setup_guest_mappings");

    buffer.lock();
    buffer.block_all_cpu_backing_writes();

    let start = Arc::new(Barrier::new(2));
    let start_b = start.clone();
    let buffer_b = buffer.clone();
    let guest_memory_b = guest_memory.clone();

    let thread_b = thread::spawn(move || {
        start_b.wait();
        // A is still holding the lock: the trap's try-lock must fail.
        assert!(!guest_memory_b.invoke_write_trap(handle));
        loop {
            if guest_memory_b.invoke_write_trap(handle) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        buffer_b.dirty_state()
    });

    start.wait();
    thread::sleep(Duration::from_millis(50));
    buffer.unlock();

    assert_eq!(thread_b.join().unwrap(), DirtyState::CpuDirty);
}

#[test]
fn immutable_write_needs_gpu_copy() {
    let buffer = testing::guest_backed_buffer(4096);
    buffer.lock();
    buffer.block_all_cpu_backing_writes();

    let retry = buffer.write(true, &|| {}, &[1, 2, 3, 4], 0, None);
    assert!(retry, "no callback provided means the caller must retry");

    let calls = AtomicUsize::new(0);
    let retry = buffer.write(
        true,
        &|| {},
        &[1, 2, 3, 4],
        0,
        Some(&|| {
            calls.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(!retry);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut out = [0u8; 4];
    buffer.read(true, &|| {}, &mut out, 0);
    assert_eq!(out, [1, 2, 3, 4]);

    buffer.unlock();
}

#[test]
fn view_follows_buffer_migration() {
    let arena = DelegateArena::new();
    let buffer_1 = testing::host_only_buffer(4096);
    let buffer_2 = testing::host_only_buffer(4096);
    let delegate_1 = arena.alloc(Arc::downgrade(&buffer_1));
    let delegate_2 = arena.alloc(Arc::downgrade(&buffer_2));

    let view = buffer_1.get_view(delegate_1, 16, 32);
    assert!(Arc::ptr_eq(&view.get_buffer().unwrap(), &buffer_1));

    // The manager merges buffer_1 into buffer_2 at offset 64.
    delegate_1.link(delegate_2, 64);

    let locked = view.lock();
    assert!(Arc::ptr_eq(&locked, &buffer_2));
    assert_eq!(view.get_offset(), 16 + 64);
    locked.unlock();
}

#[test]
fn megabuffer_view_grows_cached_entry_via_max() {
    let buffer = testing::guest_backed_buffer(64 * 1024);
    // Force staging to be worth it regardless of sequence number.
    let _ = buffer.write(true, &|| {}, &[0u8; 1], 0, None);

    let allocator = NopMegabufferAllocator;
    let cycle: Arc<dyn buffer_coherency::fence::FenceCycle> = Arc::new(NopFenceCycle);

    let first = buffer
        .try_megabuffer_view(&allocator, cycle.clone(), 7, 0, 1024)
        .expect("staging should succeed for a recently-updated buffer");
    assert_eq!(first.size, 1024);

    let second = buffer
        .try_megabuffer_view(&allocator, cycle, 7, 0, 4096)
        .expect("second call within the same execution should also succeed");
    assert_eq!(second.size, 4096);
}

#[test]
fn context_tag_reentry_needs_a_single_unlock() {
    let buffer = testing::host_only_buffer(4096);
    let tag = ContextTag::new();
    assert!(buffer.lock_with_tag(tag));
    assert!(!buffer.lock_with_tag(tag));
    buffer.unlock();
    assert!(buffer.try_lock());
    buffer.unlock();
}
