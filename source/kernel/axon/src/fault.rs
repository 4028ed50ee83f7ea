// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User page-fault delivery.
//!
//! A fault from user privilege is reflected to the domain's registered
//! upcall on its exception stack. A fault taken while already on that stack
//! nests below the current record with a one-word gap.

use axon_abi::layout::PGSIZE;
use axon_abi::{PteFlags, UTrapframe};

use crate::env::EnvTable;
use crate::mm::user;
use crate::trap::TrapFrame;
use crate::types::DomainId;

/// Why a fault could not be reflected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unhandled {
    /// No upcall registered.
    NoHandler,
    /// Record would land outside a writable exception stack.
    BadStack(u32),
}

/// Where the record for a fault at `esp` goes, given the exception stack top.
pub(crate) fn record_address(esp: u32, xtop: u32) -> u32 {
    let size = UTrapframe::SIZE as u32;
    if esp < xtop && esp >= xtop - PGSIZE {
        esp.wrapping_sub(4 + size)
    } else {
        xtop - size
    }
}

/// Pushes a fault record for `id` and redirects it to its upcall.
///
/// On success the domain's saved frame resumes in the handler with the stack
/// pointing at the record.
pub(crate) fn deliver(envs: &mut EnvTable, id: DomainId, frame: &TrapFrame, xtop: u32) -> Result<(), Unhandled> {
    let env = envs.get_mut(id).ok_or(Unhandled::NoHandler)?;
    let upcall = env.upcall.ok_or(Unhandled::NoHandler)?;
    let addr = record_address(frame.esp, xtop);
    if addr < xtop - PGSIZE || addr > xtop - UTrapframe::SIZE as u32 {
        return Err(Unhandled::BadStack(addr));
    }
    user::check(&env.space, addr, UTrapframe::SIZE, PteFlags::W | PteFlags::U).map_err(Unhandled::BadStack)?;
    let record = UTrapframe {
        fault_va: frame.fault_va,
        err: frame.err,
        regs: frame.regs,
        eip: frame.eip,
        eflags: frame.eflags,
        esp: frame.esp,
    };
    user::copy_out(&env.space, addr, &record.to_le_bytes()).map_err(Unhandled::BadStack)?;
    env.frame.eip = upcall;
    env.frame.esp = addr;
    log_trace!(target: "trap", "{} fault va {:08x} -> upcall {:08x}", id, frame.fault_va, upcall);
    Ok(())
}
