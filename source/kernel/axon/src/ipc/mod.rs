// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous IPC: one value and at most one page per exchange.
//!
//! A send succeeds only while the target is blocked in receive. Both halves
//! run under the big kernel lock, so the check and the delivery in
//! [`try_send`] cannot interleave with another domain. A page delivered COW
//! turns the sender's writable mapping COW as well.

use axon_abi::{EnvStatus, PteFlags, SysError};

use crate::env::EnvTable;
use crate::mm::MapError;
use crate::types::{DomainId, VirtAddr};

/// Error returned by the IPC primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target does not exist or is being torn down.
    BadEnv,
    /// Target is not blocked in receive.
    NotRecv,
    /// Bad address, permission word or source mapping.
    Inval,
}

impl From<IpcError> for SysError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::BadEnv => SysError::BadEnv,
            IpcError::NotRecv => SysError::IpcNotRecv,
            IpcError::Inval => SysError::Inval,
        }
    }
}

/// Knobs that shape delivery.
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    /// First address above the user part of the address space.
    pub ceiling: u32,
    /// Reject a page offered to a receiver that asked for none.
    pub strict_page_offer: bool,
}

/// Page offered by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub va: VirtAddr,
    pub perm: PteFlags,
}

impl Offer {
    /// Decodes the `(srcva, perm)` argument pair. An address at or above the
    /// ceiling means no page is offered.
    pub fn decode(srcva: u32, perm: u32, ceiling: u32) -> Result<Option<Self>, IpcError> {
        let va = VirtAddr::optional_user_page(srcva, ceiling).map_err(|_| IpcError::Inval)?;
        let Some(va) = va else {
            return Ok(None);
        };
        let perm = PteFlags::from_user(perm).ok_or(IpcError::Inval)?;
        Ok(Some(Self { va, perm }))
    }
}

/// Outcome of a successful send, reported for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub to: DomainId,
    pub perm: PteFlags,
}

/// Delivers `value` and optionally a page from `sender` to `target`.
///
/// Never blocks. On success the receiver's saved registers carry the
/// result of its receive call and it becomes RUNNABLE.
pub fn try_send(
    table: &mut EnvTable,
    sender: DomainId,
    target: DomainId,
    value: u32,
    offer: Option<Offer>,
    policy: SendPolicy,
) -> Result<Delivery, IpcError> {
    let rx = table.get(target).ok_or(IpcError::BadEnv)?;
    if rx.status() == EnvStatus::Dying {
        return Err(IpcError::BadEnv);
    }
    if !rx.ipc.recving || rx.status() != EnvStatus::NotRunnable {
        return Err(IpcError::NotRecv);
    }
    let dst = rx.ipc.dst;
    let max_perm = rx.ipc.max_perm;

    let mut transfer = None;
    if let Some(offer) = offer {
        let tx = table.get(sender).ok_or(IpcError::BadEnv)?;
        let source = tx.space.lookup(offer.va.raw()).ok_or(IpcError::Inval)?;
        if offer.perm.contains(PteFlags::W) && !source.flags.contains(PteFlags::W) {
            return Err(IpcError::Inval);
        }
        match dst {
            Some(dst) => {
                let perm = (offer.perm & max_perm) | PteFlags::USER_REQUIRED;
                transfer = Some((dst, source.page.clone(), perm));
            }
            None if policy.strict_page_offer => return Err(IpcError::NotRecv),
            None => {
                log_debug!(target: "ipc", "{} offered a page to {} which wants none", sender, target);
            }
        }
    }

    let mut perm = PteFlags::empty();
    if let Some((dst, page, flags)) = transfer {
        let rx = table.get_mut(target).ok_or(IpcError::BadEnv)?;
        let displaced = rx.space.map(dst.raw(), page.clone(), flags).map_err(|err: MapError| {
            log_debug!(target: "ipc", "map into {} failed: {}", target, err);
            IpcError::Inval
        })?;
        perm = flags;
        if flags.is_cow() {
            table.seal_cow(&page);
        }
        if let Some(old) = displaced {
            table.settle(&old);
        }
    }

    let rx = table.get_mut(target).ok_or(IpcError::BadEnv)?;
    rx.ipc.recving = false;
    rx.ipc.from = Some(sender);
    rx.ipc.value = value;
    rx.ipc.perm = perm;
    rx.frame.regs.eax = 0;
    rx.frame.regs.edx = value;
    rx.frame.regs.ecx = sender.as_raw();
    rx.frame.regs.ebx = perm.bits();
    table.set_status(target, EnvStatus::Runnable);
    log_trace!(target: "ipc", "{} -> {} value {:#x} perm {:#x}", sender, target, value, perm.bits());
    Ok(Delivery { to: target, perm })
}

/// Blocks `caller` in receive.
///
/// `dstva` at or above the ceiling means no page is wanted. `max_perm` of
/// zero accepts any permission a sender may grant. The caller must be
/// rescheduled afterwards; its saved `eax` reports `IpcNoDelivery` unless a
/// send overwrites it.
pub fn recv(table: &mut EnvTable, caller: DomainId, dstva: u32, max_perm: u32, ceiling: u32) -> Result<(), IpcError> {
    let dst = VirtAddr::optional_user_page(dstva, ceiling).map_err(|_| IpcError::Inval)?;
    let max_perm = match max_perm {
        0 => PteFlags::SYSCALL,
        raw => PteFlags::from_bits(raw).filter(|p| PteFlags::SYSCALL.contains(*p)).ok_or(IpcError::Inval)?,
    };
    let env = table.get_mut(caller).ok_or(IpcError::BadEnv)?;
    env.ipc.recving = true;
    env.ipc.dst = dst;
    env.ipc.max_perm = max_perm;
    env.ipc.from = None;
    env.ipc.perm = PteFlags::empty();
    env.frame.regs.eax = SysError::IpcNoDelivery.errno() as u32;
    table.set_status(caller, EnvStatus::NotRunnable);
    log_trace!(target: "ipc", "{} waiting (dst {:?})", caller, dst);
    Ok(())
}
