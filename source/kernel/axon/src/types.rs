// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for decoded syscall arguments and per-CPU indexing
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, CpuId, DomainId (re-export)
//! DEPENDS_ON: axon_abi::layout
//! INVARIANTS: A `VirtAddr` built by `user_page` is page aligned and strictly below the user ceiling

use core::fmt;

use axon_abi::layout::{is_aligned, PGSIZE};

pub use axon_abi::DomainId;

/// User virtual address decoded from a register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Wraps a raw address without checks (kernel-internal).
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Page-aligned address below `ceiling`.
    #[inline]
    pub fn user_page(raw: u32, ceiling: u32) -> Option<Self> {
        if raw < ceiling && is_aligned(raw) {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Optional page address: anything at or above `ceiling` means "none".
    #[inline]
    pub fn optional_user_page(raw: u32, ceiling: u32) -> Result<Option<Self>, Misaligned> {
        if raw >= ceiling {
            Ok(None)
        } else if is_aligned(raw) {
            Ok(Some(Self(raw)))
        } else {
            Err(Misaligned(raw))
        }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Address of the next page, if any.
    #[inline]
    pub fn next_page(self) -> Option<Self> {
        self.0.checked_add(PGSIZE).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Address that should have been page aligned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Misaligned(pub u32);

/// Logical CPU identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u8);

impl CpuId {
    /// The bootstrap processor.
    pub const BOOT: CpuId = CpuId(0);

    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
