// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Domain control blocks, the fixed-size domain table and the status state machine
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (tests_prop.rs)
//! PUBLIC API: Env, EnvTable, IpcState, Transition, EnvError, DestroyOutcome, transition_allowed
//! DEPENDS_ON: mm::AddressSpace, trap::TrapFrame, axon_abi::{DomainId, EnvStatus}
//! INVARIANTS: Every status change goes through `EnvTable::set_status`;
//!             a reused slot always carries a new generation;
//!             a slot is reclaimed only from DYING and never while RUNNING on a CPU

#[cfg(test)]
mod tests_prop;

use alloc::vec::Vec;

use axon_abi::{DomainId, EnvStatus, PteFlags};

use crate::mm::{AddressSpace, PageRef};
use crate::trap::TrapFrame;
use crate::types::{CpuId, VirtAddr};

const MAX_GENERATION: u32 = (1 << (32 - DomainId::GENERATION_SHIFT)) - 1;

/// Rendezvous state kept in each control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in receive.
    pub recving: bool,
    /// Where the receiver wants a page, if anywhere.
    pub dst: Option<VirtAddr>,
    /// Upper bound on the permissions the receiver accepts.
    pub max_perm: PteFlags,
    /// Last delivered value.
    pub value: u32,
    /// Sender of the last delivery.
    pub from: Option<DomainId>,
    /// Permissions of the transferred page; empty if none was sent.
    pub perm: PteFlags,
}

impl Default for IpcState {
    fn default() -> Self {
        Self {
            recving: false,
            dst: None,
            max_perm: PteFlags::SYSCALL,
            value: 0,
            from: None,
            perm: PteFlags::empty(),
        }
    }
}

/// Protection domain control block.
pub struct Env {
    id: DomainId,
    parent: Option<DomainId>,
    status: EnvStatus,
    /// Saved user registers.
    pub frame: TrapFrame,
    pub space: AddressSpace,
    /// Page-fault upcall entry point.
    pub upcall: Option<u32>,
    pub ipc: IpcState,
    /// CPU this domain last ran on.
    pub cpu: Option<CpuId>,
    /// Times this domain was entered.
    pub runs: u32,
}

impl Env {
    fn vacant(slot: usize) -> Self {
        let id = DomainId::new(0, slot);
        Self {
            id,
            parent: None,
            status: EnvStatus::Free,
            frame: TrapFrame::default(),
            space: AddressSpace::new(id),
            upcall: None,
            ipc: IpcState::default(),
            cpu: None,
            runs: 0,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn parent(&self) -> Option<DomainId> {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    /// True while the slot is in use.
    pub fn is_live(&self) -> bool {
        self.status != EnvStatus::Free
    }

    /// True if currently executing on `cpu`.
    pub fn is_running_on(&self, cpu: CpuId) -> bool {
        self.status == EnvStatus::Running && self.cpu == Some(cpu)
    }
}

/// One observed status change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub domain: DomainId,
    pub from: EnvStatus,
    pub to: EnvStatus,
}

/// Status changes the kernel may perform.
///
/// `FREE -> NOT_RUNNABLE` is the child created by exofork, held back until
/// its parent has finished building it.
pub const fn transition_allowed(from: EnvStatus, to: EnvStatus) -> bool {
    use EnvStatus::*;
    matches!(
        (from, to),
        (Free, Runnable)
            | (Free, NotRunnable)
            | (Runnable, Running)
            | (Running, Runnable)
            | (Running, NotRunnable)
            | (NotRunnable, Runnable)
            | (Runnable, Dying)
            | (Running, Dying)
            | (NotRunnable, Dying)
            | (Dying, Free)
    )
}

/// Errors from domain table operations.
#[must_use = "domain errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Unknown, stale or inaccessible domain id.
    BadEnv,
    /// Every slot is in use.
    NoFreeEnv,
}

/// What `destroy` did with the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Slot reclaimed immediately.
    Freed,
    /// Marked DYING; reclaimed once it is off-CPU.
    Deferred,
}

/// Fixed-size table of control blocks.
pub struct EnvTable {
    slots: Vec<Env>,
    transitions: Option<Vec<Transition>>,
}

impl EnvTable {
    pub fn new(slots: usize, record_transitions: bool) -> Self {
        Self {
            slots: (0..slots).map(Env::vacant).collect(),
            transitions: record_transitions.then(Vec::new),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Control block at `slot`, whatever its status.
    pub fn slot(&self, slot: usize) -> Option<&Env> {
        self.slots.get(slot)
    }

    /// Live domain named by `id` (generation must match).
    pub fn get(&self, id: DomainId) -> Option<&Env> {
        self.slots.get(id.slot()).filter(|e| e.id == id && e.is_live())
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut Env> {
        self.slots.get_mut(id.slot()).filter(|e| e.id == id && e.is_live())
    }

    /// Resolves a raw id from a system call made by `caller`.
    ///
    /// Zero names the caller. With `check_perm` the target must be the caller
    /// or one of its immediate children.
    pub fn resolve(&self, caller: DomainId, raw: u32, check_perm: bool) -> Result<DomainId, EnvError> {
        let id = DomainId::from_raw(raw);
        if id.is_self() {
            return Ok(caller);
        }
        let env = self.get(id).ok_or(EnvError::BadEnv)?;
        if check_perm && env.id != caller && env.parent != Some(caller) {
            return Err(EnvError::BadEnv);
        }
        Ok(env.id)
    }

    /// Reserves the lowest free slot under a fresh generation and moves it
    /// out of FREE into `status` (RUNNABLE or NOT_RUNNABLE).
    pub fn alloc(&mut self, parent: Option<DomainId>, status: EnvStatus) -> Result<DomainId, EnvError> {
        let slot = self.slots.iter().position(|e| !e.is_live()).ok_or(EnvError::NoFreeEnv)?;
        let env = &mut self.slots[slot];
        let mut generation = env.id.generation() + 1;
        if generation > MAX_GENERATION {
            generation = 1;
        }
        let id = DomainId::new(generation, slot);
        *env = Env::vacant(slot);
        env.id = id;
        env.parent = parent;
        env.space = AddressSpace::new(id);
        self.set_status(id, status);
        Ok(id)
    }

    /// Moves `id` to `to`. Setting the current status again is a no-op.
    ///
    /// # Panics
    /// On a transition outside the state machine; that is a kernel bug.
    pub fn set_status(&mut self, id: DomainId, to: EnvStatus) {
        let Some(env) = self.slots.get_mut(id.slot()).filter(|e| e.id == id) else {
            panic!("status change for unknown domain {}", id);
        };
        let from = env.status;
        if from == to {
            return;
        }
        assert!(transition_allowed(from, to), "illegal transition {:?} -> {:?} for {}", from, to, id);
        env.status = to;
        log_trace!(target: "env", "{} {:?} -> {:?}", id, from, to);
        if let Some(log) = &mut self.transitions {
            log.push(Transition { domain: id, from, to });
        }
    }

    /// Marks `id` for teardown on behalf of `cpu` and reclaims it if nothing is running it.
    pub fn destroy(&mut self, id: DomainId, cpu: CpuId) -> Result<DestroyOutcome, EnvError> {
        let env = self.get(id).ok_or(EnvError::BadEnv)?;
        let status = env.status;
        if status == EnvStatus::Dying {
            return Ok(DestroyOutcome::Deferred);
        }
        let on_cpu = status == EnvStatus::Running;
        if on_cpu && env.cpu != Some(cpu) {
            log_debug!(target: "env", "{} running on another cpu; deferring teardown", id);
        }
        self.set_status(id, EnvStatus::Dying);
        if on_cpu {
            return Ok(DestroyOutcome::Deferred);
        }
        self.free(id);
        Ok(DestroyOutcome::Freed)
    }

    /// Reclaims a DYING domain: releases its mappings and resets the slot.
    ///
    /// Returns the number of mappings released.
    pub fn free(&mut self, id: DomainId) -> usize {
        let Some(env) = self.get_mut(id) else {
            return 0;
        };
        let released = env.space.clear();
        env.upcall = None;
        env.ipc = IpcState::default();
        env.cpu = None;
        let count = released.len();
        self.set_status(id, EnvStatus::Free);
        for page in &released {
            self.settle(page);
        }
        log_info!(target: "env", "[{}] free env", id);
        count
    }

    /// Promotes the last remaining COW mapping of `page` back to writable.
    ///
    /// Called whenever a mapping of `page` went away. A COW page owned by a
    /// single mapping has no sharer left to protect, so the owner gets W back.
    pub fn settle(&mut self, page: &PageRef) {
        if page.mapping_count() != 1 {
            return;
        }
        let Some(owner) = page.owners().first().copied() else {
            return;
        };
        let Some(env) = self.get_mut(owner.domain) else {
            return;
        };
        let Some(flags) = env.space.lookup(owner.va).filter(|m| m.page.same_frame(page)).map(|m| m.flags) else {
            return;
        };
        if flags.is_cow() {
            let promoted = (flags - PteFlags::COW) | PteFlags::W;
            if env.space.protect(owner.va, promoted).is_ok() {
                log_debug!(target: "env", "{} sole owner of cow page at {:08x}; now writable", owner.domain, owner.va);
            }
        }
    }

    /// Turns every plain writable mapping of `page` into a COW mapping.
    ///
    /// Called after `page` gained a COW mapping, so no sharer keeps writing
    /// into a frame another domain treats as its private copy.
    pub fn seal_cow(&mut self, page: &PageRef) {
        for owner in page.owners() {
            let Some(env) = self.get_mut(owner.domain) else {
                continue;
            };
            let Some(flags) = env.space.lookup(owner.va).filter(|m| m.page.same_frame(page)).map(|m| m.flags) else {
                continue;
            };
            if flags.contains(PteFlags::W) {
                let sealed = (flags - PteFlags::W) | PteFlags::COW;
                if env.space.protect(owner.va, sealed).is_ok() {
                    log_debug!(target: "env", "{} page at {:08x} now shared cow", owner.domain, owner.va);
                }
            }
        }
    }

    /// Live domains in slot order.
    pub fn live(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().filter(|e| e.is_live())
    }

    /// Drains the transition log (empty when recording is off).
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        self.transitions.as_mut().map(core::mem::take).unwrap_or_default()
    }
}
