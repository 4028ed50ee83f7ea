// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fork.
//!
//! The parent shares every present page below the user ceiling with the
//! child. Writable pages become COW in both address spaces; the first write
//! by either side is repaired by [`protect_fault_handler`].

use core::fmt;

use axon_abi::layout::{PGSIZE, PTSIZE};
use axon_abi::{DomainId, EnvStatus, PteFlags, SysError};

use crate::pgfault::{protect_fault_handler, set_pgfault_handler};
use crate::sys::{self, SELF};
use crate::UserEnv;

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Running in the parent; carries the child id.
    Parent(DomainId),
    /// Running in the child.
    Child,
}

/// Fork failure, by the step that failed.
#[must_use = "fork errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the COW handler in the parent.
    Handler(SysError),
    /// Creating the child.
    Exofork(SysError),
    /// Sharing the page at `va`.
    Duplicate { va: u32, err: SysError },
    /// Giving the child its own exception stack.
    ExceptionStack(SysError),
    /// Registering the child's upcall.
    Upcall(SysError),
    /// Marking the child runnable.
    Start(SysError),
}

impl ForkError {
    /// Underlying kernel error.
    pub fn sys_error(self) -> SysError {
        match self {
            Self::Handler(err)
            | Self::Exofork(err)
            | Self::ExceptionStack(err)
            | Self::Upcall(err)
            | Self::Start(err) => err,
            Self::Duplicate { err, .. } => err,
        }
    }
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { va, err } => write!(f, "fork: sharing page {:08x}: {}", va, err),
            other => write!(f, "fork: {:?}", other),
        }
    }
}

/// Shares virtual page `pn` of the caller with `target`.
///
/// Read-only pages are mapped as they are. Writable or COW pages are mapped
/// COW into the target first and then re-marked COW in the caller, so the
/// page is never writable while shared.
pub fn duplicate_page<E: UserEnv>(env: &mut E, target: DomainId, pn: u32) -> Result<(), SysError> {
    let va = pn * PGSIZE;
    let flags = env.page_flags(va).ok_or(SysError::Inval)? & PteFlags::SYSCALL;
    if !flags.intersects(PteFlags::W | PteFlags::COW) {
        return sys::page_map(env, SELF, va, target, va, flags);
    }
    let cow = (flags - PteFlags::W) | PteFlags::COW;
    sys::page_map(env, SELF, va, target, va, cow)?;
    sys::page_map(env, SELF, va, SELF, va, cow)
}

/// Creates a child sharing the caller's memory copy-on-write.
///
/// The exception stack is never shared: the child gets a fresh one.
pub fn fork<E: UserEnv>(env: &mut E) -> Result<ForkOutcome, ForkError> {
    set_pgfault_handler(env, protect_fault_handler::<E>).map_err(ForkError::Handler)?;
    let child = sys::exofork(env).map_err(ForkError::Exofork)?;
    if child.is_self() {
        return Ok(ForkOutcome::Child);
    }

    let layout = env.layout();
    let xstack = layout.exception_stack_page();
    let mut va = 0u32;
    while va < layout.user_top {
        if !env.table_present(va) {
            va += PTSIZE;
            continue;
        }
        let present = env.page_flags(va).is_some_and(|f| f.contains(PteFlags::USER_REQUIRED));
        if va != xstack && present {
            duplicate_page(env, child, va / PGSIZE).map_err(|err| ForkError::Duplicate { va, err })?;
        }
        va += PGSIZE;
    }

    sys::page_alloc(env, child, xstack, PteFlags::USER_RW).map_err(ForkError::ExceptionStack)?;
    let entry = env.upcall_entry();
    sys::env_set_pgfault_upcall(env, child, entry).map_err(ForkError::Upcall)?;
    sys::env_set_status(env, child, EnvStatus::Runnable).map_err(ForkError::Start)?;
    Ok(ForkOutcome::Parent(child))
}
