// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Initial domain construction from an in-memory program image
//! OWNERS: @kernel-team
//! PUBLIC API: ProgramImage, Segment, CreateError
//! DEPENDS_ON: env::EnvTable, mm::AddressSpace, hal::FrameAllocator
//! INVARIANTS: Segments stay below the user ceiling and clear of the stacks; a failed load leaves the slot FREE
//!             with no mappings

use core::fmt;

use axon_abi::layout::{round_down, round_up, PGSIZE};
use axon_abi::{EnvStatus, PteFlags};

use crate::config::KernelConfig;
use crate::env::{EnvError, EnvTable};
use crate::hal::FrameAllocator;
use crate::mm::{user, AddressSpace, MapError};
use crate::trap::TrapFrame;
use crate::types::DomainId;

/// One loadable segment.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    /// Load address; need not be page aligned.
    pub va: u32,
    /// Initialised bytes; the rest up to `mem_size` is zero.
    pub data: &'a [u8],
    pub mem_size: u32,
    pub writable: bool,
}

/// Program image handed to `Kernel::create_domain`.
#[derive(Clone, Copy, Debug)]
pub struct ProgramImage<'a> {
    pub entry: u32,
    pub segments: &'a [Segment<'a>],
}

/// Error returned when a domain cannot be created.
#[must_use = "creation errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// No free slot.
    Env(EnvError),
    /// Out of physical pages.
    NoMem,
    /// Segment overlaps the stacks, crosses the ceiling or has more data than memory.
    BadSegment(u32),
    /// Mapping was refused.
    Map(MapError),
}

impl From<EnvError> for CreateError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for CreateError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(err) => write!(f, "no slot: {:?}", err),
            Self::NoMem => f.write_str("out of memory"),
            Self::BadSegment(va) => write!(f, "bad segment at {:08x}", va),
            Self::Map(err) => write!(f, "map failed: {}", err),
        }
    }
}

fn check_segment(seg: &Segment<'_>, limit: u32) -> Result<(), CreateError> {
    let end = u64::from(seg.va) + u64::from(seg.mem_size);
    if seg.data.len() as u64 > u64::from(seg.mem_size) || end > u64::from(limit) {
        return Err(CreateError::BadSegment(seg.va));
    }
    Ok(())
}

fn populate(
    space: &mut AddressSpace,
    frames: &dyn FrameAllocator,
    config: &KernelConfig,
    image: &ProgramImage<'_>,
) -> Result<(), CreateError> {
    let stack_base = config.stack_top() - PGSIZE;
    for seg in image.segments {
        check_segment(seg, stack_base)?;
        let mut flags = PteFlags::USER_REQUIRED;
        if seg.writable {
            flags |= PteFlags::W;
        }
        let mut va = round_down(seg.va);
        let end = round_up(seg.va + seg.mem_size);
        while va < end {
            match space.flags(va) {
                Some(old) => space.protect(va, old | flags)?,
                None => {
                    let page = frames.alloc_zeroed().ok_or(CreateError::NoMem)?;
                    let _ = space.map(va, page, flags)?;
                }
            }
            va += PGSIZE;
        }
        user::copy_out(space, seg.va, seg.data).map_err(CreateError::BadSegment)?;
    }
    let stack = frames.alloc_zeroed().ok_or(CreateError::NoMem)?;
    let _ = space.map(stack_base, stack, PteFlags::USER_RW)?;
    Ok(())
}

/// Creates a RUNNABLE domain with no parent from `image`.
pub(crate) fn create(
    envs: &mut EnvTable,
    frames: &dyn FrameAllocator,
    config: &KernelConfig,
    image: &ProgramImage<'_>,
) -> Result<DomainId, CreateError> {
    // The big lock is held, so nothing can dispatch the slot before it is built.
    let id = envs.alloc(None, EnvStatus::Runnable)?;
    let Some(env) = envs.get_mut(id) else {
        return Err(CreateError::Env(EnvError::BadEnv));
    };
    if let Err(err) = populate(&mut env.space, frames, config, image) {
        log_warn!(target: "env", "load of {} failed: {}", id, err);
        envs.set_status(id, EnvStatus::Dying);
        let _ = envs.free(id);
        return Err(err);
    }
    env.frame = TrapFrame::user(image.entry, config.stack_top());
    log_info!(target: "env", "[00000000] new env {}", id);
    Ok(id)
}
