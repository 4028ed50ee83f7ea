// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel access to user memory through a domain's page tables.

use alloc::vec;
use alloc::vec::Vec;

use axon_abi::layout::{round_down, PGSIZE, ULIM};
use axon_abi::PteFlags;

use super::page::PAGE_SIZE;
use super::AddressSpace;

/// Verifies that `[va, va + len)` is mapped with at least `perm | P` and below `ULIM`.
///
/// On failure returns the first offending address.
pub fn check(space: &AddressSpace, va: u32, len: usize, perm: PteFlags) -> Result<(), u32> {
    if len == 0 {
        return Ok(());
    }
    let end = u64::from(va) + len as u64;
    if end > u64::from(ULIM) {
        return Err(va.max(ULIM));
    }
    let need = perm | PteFlags::P;
    let mut page = round_down(va);
    while u64::from(page) < end {
        match space.flags(page) {
            Some(flags) if flags.contains(need) => {}
            _ => return Err(page.max(va)),
        }
        match page.checked_add(PGSIZE) {
            Some(next) => page = next,
            None => break,
        }
    }
    Ok(())
}

/// Copies bytes out of user memory. The range must already be checked.
pub fn copy_in(space: &AddressSpace, va: u32, len: usize) -> Result<Vec<u8>, u32> {
    let mut out = vec![0u8; len];
    let mut done = 0usize;
    while done < len {
        let cur = va.wrapping_add(done as u32);
        let off = (cur % PGSIZE) as usize;
        let chunk = (PAGE_SIZE - off).min(len - done);
        let m = space.lookup(round_down(cur)).ok_or(cur)?;
        m.page.read(off, &mut out[done..done + chunk]);
        done += chunk;
    }
    Ok(out)
}

/// Copies bytes into user memory. The range must already be checked.
pub fn copy_out(space: &AddressSpace, va: u32, data: &[u8]) -> Result<(), u32> {
    let mut done = 0usize;
    while done < data.len() {
        let cur = va.wrapping_add(done as u32);
        let off = (cur % PGSIZE) as usize;
        let chunk = (PAGE_SIZE - off).min(data.len() - done);
        let m = space.lookup(round_down(cur)).ok_or(cur)?;
        m.page.write(off, &data[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}
