// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::all)]

//! CONTEXT: axon execution core: trap dispatch, domain table, scheduling, COW fault upcalls, rendezvous IPC
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Transfer, TrapSource, KernelConfig, TrapFrame, hal::*
//! DEPENDS_ON: axon-abi, spin, bitflags, alloc
//! INVARIANTS: One CPU executes kernel logic at a time (big kernel lock); interrupts disabled in dispatch;
//!             COW and W never coexist on a mapping; reclamation of a domain is deferred until it is off-CPU
//! ADR: docs/adr/0001-execution-core-boundaries.md

extern crate alloc;

#[macro_use]
pub mod log;

pub mod config;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod smp;
pub mod syscall;
pub mod trap;
pub mod types;

mod fault;
mod kernel;

#[cfg(target_os = "none")]
pub mod heap;
#[cfg(all(target_os = "none", feature = "panic_handler"))]
mod panic;

pub use axon_abi as abi;
pub use config::{ConfigError, KernelConfig};
pub use kernel::{DomainInfo, Kernel, Transfer, TrapSource};
pub use trap::TrapFrame;
pub use types::CpuId;
