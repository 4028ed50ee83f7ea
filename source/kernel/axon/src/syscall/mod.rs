// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult
//! DEPENDS_ON: env, ipc, mm, hal, syscall::api
//! INVARIANTS: Numbers come from axon_abi::Syscall; decode/check/execute discipline;
//!             handlers never switch domains themselves (they return Reschedule)
//! ADR: docs/adr/0001-execution-core-boundaries.md

pub mod api;

use core::fmt;

use axon_abi::{SysError, Syscall};

use crate::env::EnvError;
use crate::hal::NicError;
use crate::ipc::IpcError;
use crate::mm::MapError;

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in edx, ecx, ebx, edi, esi.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [u32; 5],
}

impl Args {
    pub const fn new(regs: [u32; 5]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> u32 {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Domain lookup or allocation failed.
    Env(EnvError),
    /// Mapping could not be installed.
    Map(MapError),
    /// Rendezvous failed.
    Ipc(IpcError),
    /// Malformed argument.
    Inval,
    /// Out of physical pages.
    NoMem,
    /// No network device attached.
    NoNic,
    /// Device reported a transient condition.
    Nic(NicError),
    /// Caller passed memory it may not access; it is destroyed.
    Fault(u32),
    /// Switch domains on trap exit without writing a return value.
    ///
    /// Handlers must not schedule internally; the kernel performs the switch
    /// once dispatch has finished so the caller's frame stays consistent.
    Reschedule,
}

impl Error {
    /// ABI error written back to the caller, if this error is reported at all.
    pub fn sys_error(self) -> Option<SysError> {
        let err = match self {
            Self::InvalidSyscall => SysError::NoSys,
            Self::Env(EnvError::BadEnv) => SysError::BadEnv,
            Self::Env(EnvError::NoFreeEnv) => SysError::NoFreeEnv,
            Self::Map(_) | Self::Inval => SysError::Inval,
            Self::Ipc(err) => err.into(),
            Self::NoMem => SysError::NoMem,
            Self::NoNic => SysError::NoNic,
            Self::Nic(NicError::Busy) => SysError::NicBusy,
            Self::Nic(NicError::Empty) => SysError::RxEmpty,
            Self::Fault(_) | Self::Reschedule => return None,
        };
        Some(err)
    }
}

impl From<EnvError> for Error {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for Error {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<IpcError> for Error {
    fn from(value: IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl From<NicError> for Error {
    fn from(value: NicError) -> Self {
        Self::Nic(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<u32>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: Syscall, handler: Handler) {
        let index = number.raw() as usize;
        if index < MAX_SYSCALL {
            self.handlers[index] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: u32, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<u32> {
        self.handlers
            .get(number as usize)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
