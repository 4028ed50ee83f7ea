// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical pages shared between address spaces.
//!
//! A [`PageRef`] keeps the frame alive; the owner list records which
//! `(domain, va)` pairs map it so COW bookkeeping can find every sharer.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use axon_abi::layout::PGSIZE;
use axon_abi::DomainId;
use spin::Mutex;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = PGSIZE as usize;

/// Receives frames whose last reference was dropped.
pub trait FrameSink: Send + Sync {
    /// Returns frame `number` to the allocator.
    fn release(&self, number: u32);
}

/// One mapping of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub domain: DomainId,
    pub va: u32,
}

/// A physical page frame.
pub struct Page {
    number: u32,
    bytes: Mutex<Box<[u8; PAGE_SIZE]>>,
    owners: Mutex<Vec<Owner>>,
    sink: Option<Arc<dyn FrameSink>>,
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(sink) = &self.sink {
            sink.release(self.number);
        }
    }
}

/// Reference-counted handle to a [`Page`].
#[derive(Clone)]
pub struct PageRef(Arc<Page>);

impl PageRef {
    /// Creates a zero-filled frame. `sink` is told when the frame is released.
    pub fn zeroed(number: u32, sink: Option<Arc<dyn FrameSink>>) -> Self {
        Self(Arc::new(Page {
            number,
            bytes: Mutex::new(Box::new([0u8; PAGE_SIZE])),
            owners: Mutex::new(Vec::new()),
            sink,
        }))
    }

    /// Physical frame number.
    pub fn number(&self) -> u32 {
        self.0.number
    }

    /// True if both handles name the same frame.
    pub fn same_frame(&self, other: &PageRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of address-space mappings of this frame.
    pub fn mapping_count(&self) -> usize {
        self.0.owners.lock().len()
    }

    /// Snapshot of the current mappings.
    pub fn owners(&self) -> Vec<Owner> {
        self.0.owners.lock().clone()
    }

    pub(crate) fn add_owner(&self, owner: Owner) {
        self.0.owners.lock().push(owner);
    }

    pub(crate) fn remove_owner(&self, owner: Owner) {
        let mut owners = self.0.owners.lock();
        if let Some(pos) = owners.iter().position(|o| *o == owner) {
            owners.swap_remove(pos);
        }
    }

    /// Copies `out.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let bytes = self.0.bytes.lock();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
    }

    /// Writes `data` starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.0.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copies the whole frame from `src`.
    pub fn copy_from(&self, src: &PageRef) {
        if self.same_frame(src) {
            return;
        }
        let data = **src.0.bytes.lock();
        **self.0.bytes.lock() = data;
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageRef(#{} maps={})", self.0.number, self.mapping_count())
    }
}
