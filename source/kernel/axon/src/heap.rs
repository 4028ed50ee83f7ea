// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap backing `alloc` on bare-metal targets
//! OWNERS: @kernel-team
//! PUBLIC API: init(start, size)
//! DEPENDS_ON: linked_list_allocator
//! INVARIANTS: Initialised exactly once by the boot CPU before the first allocation

use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::LockedHeap;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

static READY: AtomicBool = AtomicBool::new(false);

/// Hands `[start, start + size)` to the kernel heap.
///
/// # Panics
/// If called twice.
///
/// # Safety
/// The region must be valid, writable, unused by anything else and live for
/// the rest of the kernel's life.
pub unsafe fn init(start: *mut u8, size: usize) {
    assert!(!READY.swap(true, Ordering::AcqRel), "kernel heap initialised twice");
    // SAFETY: caller guarantees exclusive ownership of the region.
    unsafe { HEAP.lock().init(start, size) };
    log_info!(target: "heap", "kernel heap {:p} +{:#x}", start, size);
}
