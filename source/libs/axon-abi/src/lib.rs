// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the axon kernel and user-level domains
//! OWNERS: @kernel-team @runtime
//! PUBLIC API: Syscall, SysError, PteFlags, DomainId, EnvStatus, layout::*, fault::*
//! DEPENDS_ON: bitflags
//! INVARIANTS: Syscall numbers and error codes are stable; COW and W are never requested together
//! ADR: docs/adr/0001-execution-core-boundaries.md

use core::fmt;

pub mod fault;
pub mod layout;

pub use fault::{FaultCode, PushRegs, UTrapframe};

/// Result type returned by ABI helpers.
pub type SysResult<T> = core::result::Result<T, SysError>;

/// System call numbers. Passed in `eax`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Print a user buffer on the console.
    Cputs = 0,
    /// Read one console character without blocking.
    Cgetc = 1,
    /// Return the caller's domain id.
    GetEnvId = 2,
    /// Destroy a domain (caller or child).
    EnvDestroy = 3,
    /// Allocate a zeroed page and map it.
    PageAlloc = 4,
    /// Share a mapping between two domains.
    PageMap = 5,
    /// Remove a mapping.
    PageUnmap = 6,
    /// Create a child domain from the caller's register state.
    Exofork = 7,
    /// Change a domain's status (only to RUNNABLE).
    EnvSetStatus = 8,
    /// Replace a child's saved trap frame.
    EnvSetTrapframe = 9,
    /// Register the page-fault upcall entry.
    EnvSetPgfaultUpcall = 10,
    /// Give up the CPU.
    Yield = 11,
    /// Non-blocking rendezvous send.
    IpcTrySend = 12,
    /// Blocking rendezvous receive.
    IpcRecv = 13,
    /// Milliseconds since boot.
    TimeMsec = 14,
    /// Queue a packet on the NIC.
    TransmitPacket = 15,
    /// Pull a packet from the NIC.
    ReceivePacket = 16,
}

impl Syscall {
    /// Every call, ordered by number.
    pub const ALL: [Syscall; 17] = [
        Syscall::Cputs,
        Syscall::Cgetc,
        Syscall::GetEnvId,
        Syscall::EnvDestroy,
        Syscall::PageAlloc,
        Syscall::PageMap,
        Syscall::PageUnmap,
        Syscall::Exofork,
        Syscall::EnvSetStatus,
        Syscall::EnvSetTrapframe,
        Syscall::EnvSetPgfaultUpcall,
        Syscall::Yield,
        Syscall::IpcTrySend,
        Syscall::IpcRecv,
        Syscall::TimeMsec,
        Syscall::TransmitPacket,
        Syscall::ReceivePacket,
    ];

    /// Decodes a raw syscall number.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Returns the raw number placed in `eax`.
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// Errors reported by system calls as negative return values.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysError {
    /// Unspecified or unknown problem.
    Unspecified = 1,
    /// Domain id does not exist or the caller may not touch it.
    BadEnv = 2,
    /// Invalid parameter.
    Inval = 3,
    /// Out of physical memory.
    NoMem = 4,
    /// Domain table is full.
    NoFreeEnv = 5,
    /// Memory fault.
    Fault = 6,
    /// Target is not blocked in receive.
    IpcNotRecv = 7,
    /// Unexpected end of data.
    Eof = 8,
    /// Unknown system call number.
    NoSys = 9,
    /// Transmit ring is full; retry later.
    NicBusy = 10,
    /// No packet is waiting.
    RxEmpty = 11,
    /// No network device attached.
    NoNic = 12,
    /// Receive resumed without a delivery.
    IpcNoDelivery = 13,
}

impl SysError {
    /// Positive error code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Negative value returned in `eax`.
    pub const fn errno(self) -> i32 {
        -(self as i32)
    }

    /// Decodes a positive or negative error code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code.unsigned_abs() {
            1 => Self::Unspecified,
            2 => Self::BadEnv,
            3 => Self::Inval,
            4 => Self::NoMem,
            5 => Self::NoFreeEnv,
            6 => Self::Fault,
            7 => Self::IpcNotRecv,
            8 => Self::Eof,
            9 => Self::NoSys,
            10 => Self::NicBusy,
            11 => Self::RxEmpty,
            12 => Self::NoNic,
            13 => Self::IpcNoDelivery,
            _ => return None,
        })
    }

    /// Splits a raw `eax` value into success or error.
    pub fn check(ret: i32) -> SysResult<u32> {
        if ret < 0 {
            Err(Self::from_code(ret).unwrap_or(Self::Unspecified))
        } else {
            Ok(ret as u32)
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
            Self::IpcNotRecv => "env is not recving",
            Self::Eof => "unexpected end of file",
            Self::NoSys => "no such system call",
            Self::NicBusy => "nic transmit queue full",
            Self::RxEmpty => "nic receive queue empty",
            Self::NoNic => "no network device",
            Self::IpcNoDelivery => "receive ended without a delivery",
        };
        f.write_str(msg)
    }
}

bitflags::bitflags! {
    /// Leaf page-table permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Present.
        const P = 0x001;
        /// Writable.
        const W = 0x002;
        /// User accessible.
        const U = 0x004;
        /// Write-through.
        const PWT = 0x008;
        /// Cache disable.
        const PCD = 0x010;
        /// Accessed.
        const A = 0x020;
        /// Dirty.
        const D = 0x040;
        /// Software-available bits.
        const AVAIL = 0xE00;
        /// Copy-on-write marker (one of the available bits).
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Bits a domain may pass through a system call.
    pub const SYSCALL: Self = Self::AVAIL.union(Self::P).union(Self::W).union(Self::U);

    /// Bits every user mapping must carry.
    pub const USER_REQUIRED: Self = Self::P.union(Self::U);

    /// Writable user mapping.
    pub const USER_RW: Self = Self::USER_REQUIRED.union(Self::W);

    /// Validates a permission word supplied by user space.
    pub fn from_user(raw: u32) -> Option<Self> {
        let flags = Self::from_bits(raw)?;
        if !Self::SYSCALL.contains(flags) || !flags.contains(Self::USER_REQUIRED) {
            return None;
        }
        if flags.contains(Self::COW) && flags.contains(Self::W) {
            return None;
        }
        Some(flags)
    }

    /// True if this mapping is copy-on-write.
    pub const fn is_cow(self) -> bool {
        self.contains(Self::COW)
    }
}

/// Generation-tagged domain identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DomainId(u32);

impl DomainId {
    /// Bits used for the slot index.
    pub const LOG2_SLOTS: u32 = 10;
    /// Shift applied to the generation counter.
    pub const GENERATION_SHIFT: u32 = 12;

    /// Composes an id from a generation and slot.
    pub const fn new(generation: u32, slot: usize) -> Self {
        Self((generation << Self::GENERATION_SHIFT) | (slot as u32 & ((1 << Self::LOG2_SLOTS) - 1)))
    }

    /// Wraps a raw id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id as passed in registers.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index inside the domain table.
    pub const fn slot(self) -> usize {
        (self.0 & ((1 << Self::LOG2_SLOTS) - 1)) as usize
    }

    /// Generation counter of this id.
    pub const fn generation(self) -> u32 {
        self.0 >> Self::GENERATION_SHIFT
    }

    /// Id 0 means "the caller" in system calls.
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainId({:08x})", self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Runtime status of a domain.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Marked for teardown.
    Dying = 1,
    /// Eligible to run.
    Runnable = 2,
    /// Executing on some CPU.
    Running = 3,
    /// Blocked in receive or under construction.
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes the ABI value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    /// ABI value.
    pub const fn raw(self) -> u32 {
        self as u32
    }
}
