// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page directory owned by one domain.
//!
//! Tables are allocated on first use. Every leaf stores a [`PageRef`] and the
//! permission bits; installing or removing a leaf keeps the page's owner list
//! in sync, which is what COW bookkeeping relies on.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use axon_abi::layout::{is_aligned, pdx, ptx, NPDENTRIES, NPTENTRIES, PDXSHIFT, PGSHIFT, ULIM};
use axon_abi::{DomainId, FaultCode, PteFlags};

use super::{MapError, Owner, PageRef};

/// Leaf entry: the page and its permissions.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub page: PageRef,
    pub flags: PteFlags,
}

struct Table {
    entries: Vec<Option<Mapping>>,
    live: usize,
}

impl Table {
    fn new() -> Self {
        Self { entries: vec![None; NPTENTRIES], live: 0 }
    }
}

/// Per-domain address space.
pub struct AddressSpace {
    owner: DomainId,
    dir: Vec<Option<Box<Table>>>,
    mapped: usize,
}

impl AddressSpace {
    /// Creates an empty address space for `owner`.
    pub fn new(owner: DomainId) -> Self {
        Self { owner, dir: Vec::new(), mapped: 0 }
    }

    pub fn owner(&self) -> DomainId {
        self.owner
    }

    /// Number of present leaf entries.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// True if the directory entry covering `va` has a table.
    pub fn table_present(&self, va: u32) -> bool {
        matches!(self.dir.get(pdx(va)), Some(Some(_)))
    }

    /// Returns the mapping at `va`, if present.
    pub fn lookup(&self, va: u32) -> Option<&Mapping> {
        self.dir.get(pdx(va))?.as_ref()?.entries[ptx(va)].as_ref()
    }

    /// Permission bits at `va`, if present.
    pub fn flags(&self, va: u32) -> Option<PteFlags> {
        self.lookup(va).map(|m| m.flags)
    }

    /// Installs `page` at `va`, replacing any previous mapping.
    ///
    /// Returns the displaced page so the caller can settle its sharers.
    pub fn map(&mut self, va: u32, page: PageRef, flags: PteFlags) -> Result<Option<PageRef>, MapError> {
        if !is_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if va >= ULIM {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PteFlags::P) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PteFlags::COW | PteFlags::W) {
            return Err(MapError::WritableCow);
        }
        if flags.is_cow() {
            let already_here = self.lookup(va).is_some_and(|m| m.page.same_frame(&page));
            let after = page.mapping_count() + usize::from(!already_here);
            if after < 2 {
                return Err(MapError::CowNotShared);
            }
        }
        let old = self.remove(va);
        let owner = Owner { domain: self.owner, va };
        page.add_owner(owner);
        let table = self.table_mut(va);
        table.entries[ptx(va)] = Some(Mapping { page, flags });
        table.live += 1;
        self.mapped += 1;
        Ok(old)
    }

    /// Rewrites the permission bits of an existing mapping.
    pub fn protect(&mut self, va: u32, flags: PteFlags) -> Result<(), MapError> {
        if flags.contains(PteFlags::COW | PteFlags::W) {
            return Err(MapError::WritableCow);
        }
        if !flags.contains(PteFlags::P) {
            return Err(MapError::InvalidFlags);
        }
        let entry = self
            .dir
            .get_mut(pdx(va))
            .and_then(|t| t.as_mut())
            .and_then(|t| t.entries[ptx(va)].as_mut())
            .ok_or(MapError::NotMapped)?;
        entry.flags = flags;
        Ok(())
    }

    /// Removes the mapping at `va`; absent mappings are a no-op.
    pub fn unmap(&mut self, va: u32) -> Option<PageRef> {
        self.remove(va)
    }

    /// Removes every mapping and frees the page tables.
    pub fn clear(&mut self) -> Vec<PageRef> {
        let mut released = Vec::with_capacity(self.mapped);
        for (di, slot) in self.dir.iter_mut().enumerate() {
            let Some(table) = slot.take() else { continue };
            for (ti, entry) in table.entries.into_iter().enumerate() {
                if let Some(m) = entry {
                    let va = ((di as u32) << PDXSHIFT) | ((ti as u32) << PGSHIFT);
                    m.page.remove_owner(Owner { domain: self.owner, va });
                    released.push(m.page);
                }
            }
        }
        self.dir.clear();
        self.mapped = 0;
        released
    }

    /// Present mappings in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Mapping)> + '_ {
        self.dir.iter().enumerate().flat_map(|(di, slot)| {
            slot.iter().flat_map(move |table| {
                table.entries.iter().enumerate().filter_map(move |(ti, e)| {
                    e.as_ref().map(|m| (((di as u32) << PDXSHIFT) | ((ti as u32) << PGSHIFT), m))
                })
            })
        })
    }

    /// Walks the tables the way the MMU does for a user access.
    pub fn translate(&self, va: u32, write: bool) -> Result<&PageRef, FaultCode> {
        let mut code = FaultCode::USER;
        if write {
            code |= FaultCode::WRITE;
        }
        if va >= ULIM {
            return Err(code | FaultCode::PROTECTION);
        }
        let Some(m) = self.lookup(va) else {
            return Err(code);
        };
        if !m.flags.contains(PteFlags::U) || (write && !m.flags.contains(PteFlags::W)) {
            return Err(code | FaultCode::PROTECTION);
        }
        Ok(&m.page)
    }

    fn table_mut(&mut self, va: u32) -> &mut Table {
        if self.dir.is_empty() {
            self.dir.resize_with(NPDENTRIES, || None);
        }
        self.dir[pdx(va)].get_or_insert_with(|| Box::new(Table::new()))
    }

    fn remove(&mut self, va: u32) -> Option<PageRef> {
        let slot = self.dir.get_mut(pdx(va))?;
        let table = slot.as_mut()?;
        let m = table.entries[ptx(va)].take()?;
        table.live -= 1;
        if table.live == 0 {
            *slot = None;
        }
        self.mapped -= 1;
        m.page.remove_owner(Owner { domain: self.owner, va });
        Some(m.page)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let _ = self.clear();
    }
}
