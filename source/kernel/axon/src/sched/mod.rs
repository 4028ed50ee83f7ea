// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin selection over the domain table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: pick_next(table, prev, cpu), system_idle(table)
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: Scan starts just after the previous slot and wraps once; no priorities, no aging;
//!             the previous domain is re-selected only if nothing else is RUNNABLE and it still runs here

#[cfg(test)]
mod tests_prop;

use axon_abi::EnvStatus;

use crate::env::EnvTable;
use crate::types::{CpuId, DomainId};

/// Chooses the next domain for `cpu`.
///
/// `prev` is the domain that was current on `cpu` before this decision.
/// Returns `None` when the CPU should halt.
pub fn pick_next(table: &EnvTable, prev: Option<DomainId>, cpu: CpuId) -> Option<DomainId> {
    let slots = table.len();
    if slots == 0 {
        return None;
    }
    let start = prev.map_or(0, |id| id.slot() + 1);
    let found = (0..slots)
        .filter_map(|i| table.slot((start + i) % slots))
        .find(|env| env.status() == EnvStatus::Runnable)
        .map(|env| env.id());
    if found.is_some() {
        return found;
    }
    prev.and_then(|id| table.get(id)).filter(|env| env.is_running_on(cpu)).map(|env| env.id())
}

/// True if no domain is RUNNABLE, RUNNING or DYING anywhere.
pub fn system_idle(table: &EnvTable) -> bool {
    !table
        .live()
        .any(|env| matches!(env.status(), EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying))
}
