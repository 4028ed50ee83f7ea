// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous IPC helpers.

use axon_abi::layout::KERNBASE;
use axon_abi::{DomainId, PteFlags, SysError};

use crate::sys;
use crate::UserEnv;

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMessage {
    /// The sender's value.
    pub value: u32,
    /// Who sent it.
    pub from: DomainId,
    /// Permissions of the delivered page; empty when no page moved.
    pub perm: PteFlags,
}

impl IpcMessage {
    /// True if a page was mapped at the receive address.
    pub fn has_page(&self) -> bool {
        !self.perm.is_empty()
    }
}

/// Waits for a message. With `dst` set, a page offered by the sender is
/// mapped there.
pub fn ipc_recv<E: UserEnv>(env: &mut E, dst: Option<u32>) -> Result<IpcMessage, SysError> {
    let regs = sys::ipc_recv(env, dst.unwrap_or(KERNBASE), PteFlags::empty())?;
    Ok(IpcMessage {
        value: regs.edx,
        from: DomainId::from_raw(regs.ecx),
        perm: PteFlags::from_bits_truncate(regs.ebx),
    })
}

/// Sends `value` and optionally a page to `to`, yielding until it is receiving.
///
/// Errors other than "not receiving" are returned to the caller.
pub fn ipc_send<E: UserEnv>(env: &mut E, to: DomainId, value: u32, page: Option<(u32, PteFlags)>) -> Result<(), SysError> {
    let (src_va, perm) = page.unwrap_or((KERNBASE, PteFlags::empty()));
    loop {
        match sys::ipc_try_send(env, to, value, src_va, perm) {
            Err(SysError::IpcNotRecv) => sys::yield_now(env),
            other => return other,
        }
    }
}
