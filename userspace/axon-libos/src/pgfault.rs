// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-level page-fault handling.
//!
//! The kernel pushes a [`UTrapframe`] on the exception stack and enters the
//! trampoline, which calls the handler installed here and then resumes the
//! faulting instruction.

use core::fmt;

use axon_abi::layout::{round_down, PFTEMP, PGSIZE};
use axon_abi::{FaultCode, PteFlags, SysError, UTrapframe};

use crate::sys::{self, SELF};
use crate::{FaultHandler, UserEnv};

/// Why a fault could not be repaired.
#[must_use = "an unrepaired fault must not be resumed"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgfaultError {
    /// The access was a read; there is nothing to copy.
    NotWrite { va: u32, eip: u32 },
    /// The page is not copy-on-write.
    NotCow { va: u32, flags: Option<PteFlags> },
    /// A system call failed while repairing.
    Sys(SysError),
}

impl From<SysError> for PgfaultError {
    fn from(err: SysError) -> Self {
        Self::Sys(err)
    }
}

impl fmt::Display for PgfaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWrite { va, eip } => write!(f, "read fault at {:08x} (ip {:08x})", va, eip),
            Self::NotCow { va, flags } => write!(f, "write fault on non-cow page {:08x} ({:?})", va, flags),
            Self::Sys(err) => write!(f, "fault repair failed: {}", err),
        }
    }
}

/// Installs `handler` for the calling domain.
///
/// The first call allocates the exception stack and registers the trampoline
/// with the kernel; later calls only swap the handler.
pub fn set_pgfault_handler<E: UserEnv>(env: &mut E, handler: FaultHandler<E>) -> Result<(), SysError> {
    if env.fault_handler().is_none() {
        let layout = env.layout();
        sys::page_alloc(env, SELF, layout.exception_stack_page(), PteFlags::USER_RW)?;
        let entry = env.upcall_entry();
        sys::env_set_pgfault_upcall(env, SELF, entry)?;
    }
    env.set_fault_handler(handler);
    Ok(())
}

/// Copy-on-write repair: gives the faulting domain a private writable copy.
///
/// Only a write to a COW page is legitimate here. The repair is one fresh
/// page at the scratch address, a copy, a remap over the faulting page and an
/// unmap of the scratch alias.
///
/// A page that is already writable when the handler looks at it was repaired
/// after the fault was taken: the last other sharer copied its own page away
/// and the kernel handed this mapping W back. The write is simply retried.
pub fn protect_fault_handler<E: UserEnv>(env: &mut E, utf: &UTrapframe) -> Result<(), PgfaultError> {
    let va = utf.fault_va;
    if !utf.code().contains(FaultCode::WRITE) {
        return Err(PgfaultError::NotWrite { va, eip: utf.eip });
    }
    let page = round_down(va);
    let flags = env.page_flags(page);
    if flags.is_some_and(|f| f.contains(PteFlags::USER_RW)) {
        return Ok(());
    }
    if !flags.is_some_and(PteFlags::is_cow) {
        return Err(PgfaultError::NotCow { va, flags });
    }

    sys::page_alloc(env, SELF, PFTEMP, PteFlags::USER_RW)?;
    let mut buf = [0u8; PGSIZE as usize];
    env.read(page, &mut buf);
    env.write(PFTEMP, &buf);
    sys::page_map(env, SELF, PFTEMP, SELF, page, PteFlags::USER_RW)?;
    sys::page_unmap(env, SELF, PFTEMP)?;
    Ok(())
}
