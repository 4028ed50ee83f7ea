// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for round-robin selection
//! OWNERS: @kernel-sched-team
//!
//! TEST_SCOPE:
//!   - With N runnable domains and no blocking, N consecutive decisions cover all of them
//!
//! TEST_SCENARIOS:
//!   - every_runnable_domain_runs_within_n_decisions(): arbitrary slot sets and starting points

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::pick_next;
use crate::env::EnvTable;
use crate::types::{CpuId, DomainId};
use axon_abi::EnvStatus;
use proptest::prelude::*;

proptest! {
    #[test]
    fn every_runnable_domain_runs_within_n_decisions(
        mask in 1u32..(1 << 12),
        first in 0usize..12,
    ) {
        let mut table = EnvTable::new(12, false);
        let mut runnable = Vec::new();
        for slot in 0..12 {
            if mask & (1 << slot) != 0 {
                runnable.push(table.alloc(None, EnvStatus::Runnable).unwrap());
            } else {
                table.alloc(None, EnvStatus::NotRunnable).unwrap();
            }
        }
        let n = runnable.len();
        let mut prev: Option<DomainId> = runnable.get(first % n).copied();
        if let Some(id) = prev {
            table.set_status(id, EnvStatus::Running);
            table.get_mut(id).unwrap().cpu = Some(CpuId::BOOT);
        }

        let mut seen = BTreeSet::new();
        for _ in 0..n {
            let next = pick_next(&table, prev, CpuId::BOOT).unwrap();
            if let Some(p) = prev.filter(|p| *p != next) {
                table.set_status(p, EnvStatus::Runnable);
            }
            table.set_status(next, EnvStatus::Running);
            table.get_mut(next).unwrap().cpu = Some(CpuId::BOOT);
            seen.insert(next.as_raw());
            prev = Some(next);
        }
        prop_assert_eq!(seen.len(), n);
    }
}
