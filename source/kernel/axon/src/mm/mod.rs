// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-domain two-level address spaces over reference-counted physical pages
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, PageRef, Mapping, MapError, user::{check, copy_in, copy_out}
//! DEPENDS_ON: axon_abi::{PteFlags, layout}, spin
//! INVARIANTS: COW never coexists with W; a COW mapping is only installed on a page with >= 2 mappings;
//!             every installed mapping is recorded in the page's owner list

pub mod page;
pub mod page_table;
pub mod user;


use core::fmt;

pub use axon_abi::PteFlags;
pub use page::{FrameSink, Owner, Page, PageRef};
pub use page_table::{AddressSpace, Mapping};

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address lies in the kernel part of the address space.
    OutOfRange,
    /// Flags do not describe a valid user leaf entry.
    InvalidFlags,
    /// COW was requested together with W.
    WritableCow,
    /// COW was requested for a page that would not be shared.
    CowNotShared,
    /// No mapping at the address.
    NotMapped,
    /// Access would violate the mapping's permissions.
    PermissionDenied,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
