// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space geometry and the fixed user memory layout.
//!
//! Two-level paging: a directory of 1024 tables, each mapping 1024 pages of 4 KiB.

/// Bytes per page.
pub const PGSIZE: u32 = 4096;
/// log2(PGSIZE).
pub const PGSHIFT: u32 = 12;
/// Bytes mapped by one page table.
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES as u32;
/// log2(PTSIZE).
pub const PDXSHIFT: u32 = 22;
/// Entries per page directory.
pub const NPDENTRIES: usize = 1024;
/// Entries per page table.
pub const NPTENTRIES: usize = 1024;

/// Kernel virtual base. Doubles as the "no page wanted" IPC sentinel.
pub const KERNBASE: u32 = 0xF000_0000;
/// Top of user-visible read-only mappings.
pub const ULIM: u32 = 0xEF80_0000;
/// Top of user-writable memory and the default fork ceiling.
pub const UTOP: u32 = 0xEEC0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack (one guard page below the exception stack).
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
/// Scratch region used by loaders.
pub const UTEMP: u32 = 0x0040_0000;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// Page directory index of `va`.
#[inline]
pub const fn pdx(va: u32) -> usize {
    (va >> PDXSHIFT) as usize & (NPDENTRIES - 1)
}

/// Page table index of `va`.
#[inline]
pub const fn ptx(va: u32) -> usize {
    (va >> PGSHIFT) as usize & (NPTENTRIES - 1)
}

/// Virtual page number of `va`.
#[inline]
pub const fn pgnum(va: u32) -> usize {
    (va >> PGSHIFT) as usize
}

/// Rounds `va` down to its page.
#[inline]
pub const fn round_down(va: u32) -> u32 {
    va & !(PGSIZE - 1)
}

/// Rounds `va` up to the next page boundary, saturating at the top of the space.
#[inline]
pub const fn round_up(va: u32) -> u32 {
    match va.checked_add(PGSIZE - 1) {
        Some(v) => v & !(PGSIZE - 1),
        None => round_down(u32::MAX),
    }
}

/// True if `va` is page aligned.
#[inline]
pub const fn is_aligned(va: u32) -> bool {
    va % PGSIZE == 0
}

/// Selectors and flag bits that describe privilege in a trap frame.
pub mod seg {
    /// Kernel code selector.
    pub const GD_KT: u16 = 0x08;
    /// Kernel data selector.
    pub const GD_KD: u16 = 0x10;
    /// User code selector (RPL 3).
    pub const GD_UT: u16 = 0x18 | 3;
    /// User data selector (RPL 3).
    pub const GD_UD: u16 = 0x20 | 3;
    /// Interrupt enable flag in eflags.
    pub const FL_IF: u32 = 0x0000_0200;
    /// I/O privilege level mask in eflags.
    pub const FL_IOPL_MASK: u32 = 0x0000_3000;
}
