// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU state: run status and the privileged-entry stack descriptor
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests
//! PUBLIC API: PerCpu, CpuStatus, TaskState, kernel_stack_top()
//! DEPENDS_ON: axon_abi::layout
//! INVARIANTS: Bounded CPU set (MAX_CPUS); each CPU owns a disjoint kernel stack separated by a guard gap;
//!             status updates are atomic so a halted CPU can be observed without the big lock

use core::sync::atomic::{AtomicU8, Ordering};

use axon_abi::layout::seg::GD_KD;
use axon_abi::layout::{KERNBASE, PGSIZE};

use crate::config::MAX_CPUS;
use crate::types::CpuId;

/// Top of the boot CPU's kernel stack.
pub const KSTACKTOP: u32 = KERNBASE;
/// Size of one kernel stack.
pub const KSTKSIZE: u32 = 8 * PGSIZE;
/// Unmapped guard below each kernel stack.
pub const KSTKGAP: u32 = 8 * PGSIZE;

static_assertions::const_assert!((KSTKSIZE + KSTKGAP) as u64 * MAX_CPUS as u64 <= KSTACKTOP as u64);

/// Execution status of a CPU.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    /// Not yet booted.
    Unused = 0,
    /// Executing kernel or user code.
    Started = 1,
    /// Waiting for an interrupt with the big lock released.
    Halted = 2,
}

impl CpuStatus {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Started,
            2 => Self::Halted,
            _ => Self::Unused,
        }
    }
}

/// Privileged-entry stack descriptor loaded for each CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskState {
    pub esp0: u32,
    pub ss0: u16,
}

/// Kernel stack top for `cpu`.
pub const fn kernel_stack_top(cpu: CpuId) -> u32 {
    KSTACKTOP - cpu.as_index() as u32 * (KSTKSIZE + KSTKGAP)
}

/// State owned by one CPU.
pub struct PerCpu {
    id: CpuId,
    status: AtomicU8,
    ts: TaskState,
}

impl PerCpu {
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            status: AtomicU8::new(CpuStatus::Unused as u8),
            ts: TaskState { esp0: kernel_stack_top(id), ss0: GD_KD },
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn status(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Stores `status` and returns the previous one.
    pub fn swap_status(&self, status: CpuStatus) -> CpuStatus {
        CpuStatus::from_raw(self.status.swap(status as u8, Ordering::AcqRel))
    }

    pub fn task_state(&self) -> TaskState {
        self.ts
    }
}
