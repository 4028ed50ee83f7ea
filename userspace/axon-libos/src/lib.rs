// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all)]

//! CONTEXT: User-level library for axon domains: syscall wrappers, COW fork, rendezvous IPC helpers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests against a scripted environment + tests/kernel_e2e
//!
//! PUBLIC API:
//!   - UserEnv trait: the domain's view of the machine (trap gate, own memory, page-table view)
//!   - sys: typed wrappers for every system call
//!   - pgfault: set_pgfault_handler, protect_fault_handler
//!   - fork: duplicate_page, fork, ForkOutcome, ForkError
//!   - ipc: ipc_send, ipc_recv, IpcMessage
//!   - net: transmit, receive
//!
//! DEPENDS_ON: axon-abi
//! INVARIANTS: Enters the kernel only through UserEnv::syscall; never marks the exception stack COW

use axon_abi::layout::{PGSIZE, UTOP};
use axon_abi::{PteFlags, PushRegs, Syscall, UTrapframe};

pub mod fork;
pub mod ipc;
pub mod net;
pub mod pgfault;
pub mod sys;


pub use fork::{duplicate_page, fork, ForkError, ForkOutcome};
pub use ipc::{ipc_recv, ipc_send, IpcMessage};
pub use pgfault::{protect_fault_handler, set_pgfault_handler, PgfaultError};

/// User page-fault handler run by the upcall trampoline.
pub type FaultHandler<E> = fn(&mut E, &UTrapframe) -> Result<(), PgfaultError>;

/// Address-space geometry a domain runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// First address not available to user mappings.
    pub user_top: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self { user_top: UTOP }
    }
}

impl Layout {
    /// Top of the exception stack.
    pub const fn exception_stack_top(&self) -> u32 {
        self.user_top
    }

    /// The single exception stack page.
    pub const fn exception_stack_page(&self) -> u32 {
        self.user_top - PGSIZE
    }
}

/// What a domain can do without the kernel's help, plus its one way in.
pub trait UserEnv {
    /// Traps into the kernel. Returns the registers the domain resumes with.
    fn syscall(&mut self, number: Syscall, args: [u32; 5]) -> PushRegs;

    /// Loads from the domain's own memory; faults go through the kernel.
    fn read(&mut self, va: u32, buf: &mut [u8]);

    /// Stores into the domain's own memory; faults go through the kernel.
    fn write(&mut self, va: u32, data: &[u8]);

    /// Read-only page-table view of the mapping at `va`.
    fn page_flags(&self, va: u32) -> Option<PteFlags>;

    /// True if the page table covering `va` exists.
    fn table_present(&self, va: u32) -> bool;

    /// Geometry of this domain's address space.
    fn layout(&self) -> Layout;

    /// Entry point of the assembly trampoline that calls the installed handler.
    fn upcall_entry(&self) -> u32;

    /// Installs the handler the trampoline dispatches to.
    fn set_fault_handler(&mut self, handler: FaultHandler<Self>)
    where
        Self: Sized;

    /// Currently installed handler.
    fn fault_handler(&self) -> Option<FaultHandler<Self>>
    where
        Self: Sized;
}
