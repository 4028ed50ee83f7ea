// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the domain table
//! OWNERS: @kernel-sched-team
//!
//! TEST_SCOPE:
//!   - Random alloc/run/block/wake/destroy sequences only produce allowed transitions
//!   - Ids handed out for a slot are never reused; a superseded id no longer resolves
//!
//! TEST_SCENARIOS:
//!   - random_operations_stay_in_state_machine(): every logged transition is allowed
//!   - slot_reuse_changes_id(): no id is issued twice, stale ids are refused

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::{transition_allowed, EnvTable};
use crate::types::{CpuId, DomainId};
use axon_abi::EnvStatus;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc,
    Run(usize),
    Preempt(usize),
    Block(usize),
    Wake(usize),
    Destroy(usize),
    Reap(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Alloc),
        (0usize..8).prop_map(Op::Run),
        (0usize..8).prop_map(Op::Preempt),
        (0usize..8).prop_map(Op::Block),
        (0usize..8).prop_map(Op::Wake),
        (0usize..8).prop_map(Op::Destroy),
        (0usize..8).prop_map(Op::Reap),
    ]
}

fn live_id(table: &EnvTable, slot: usize) -> Option<(DomainId, EnvStatus)> {
    let env = table.slot(slot)?;
    env.is_live().then(|| (env.id(), env.status()))
}

fn apply(table: &mut EnvTable, op: Op, issued: &mut Vec<DomainId>) {
    match op {
        Op::Alloc => {
            if let Ok(id) = table.alloc(None, EnvStatus::Runnable) {
                issued.push(id);
            }
        }
        Op::Run(slot) => {
            if let Some((id, EnvStatus::Runnable)) = live_id(table, slot) {
                table.set_status(id, EnvStatus::Running);
                if let Some(env) = table.get_mut(id) {
                    env.cpu = Some(CpuId::BOOT);
                }
            }
        }
        Op::Preempt(slot) => {
            if let Some((id, EnvStatus::Running)) = live_id(table, slot) {
                table.set_status(id, EnvStatus::Runnable);
            }
        }
        Op::Block(slot) => {
            if let Some((id, EnvStatus::Running)) = live_id(table, slot) {
                table.set_status(id, EnvStatus::NotRunnable);
            }
        }
        Op::Wake(slot) => {
            if let Some((id, EnvStatus::NotRunnable)) = live_id(table, slot) {
                table.set_status(id, EnvStatus::Runnable);
            }
        }
        Op::Destroy(slot) => {
            if let Some((id, _)) = live_id(table, slot) {
                let _ = table.destroy(id, CpuId::BOOT);
            }
        }
        Op::Reap(slot) => {
            if let Some((id, EnvStatus::Dying)) = live_id(table, slot) {
                table.free(id);
            }
        }
    }
}

proptest! {
    #[test]
    fn random_operations_stay_in_state_machine(ops in proptest::collection::vec(arb_op(), 1..200)) {
        let mut table = EnvTable::new(8, true);
        let mut issued = Vec::new();
        for op in ops {
            apply(&mut table, op, &mut issued);
        }
        for t in table.take_transitions() {
            prop_assert!(transition_allowed(t.from, t.to), "{:?}", t);
            prop_assert_ne!(t.from, t.to);
        }
    }

    #[test]
    fn slot_reuse_changes_id(ops in proptest::collection::vec(arb_op(), 1..200)) {
        // Fewer slots than the ops address, so reuse is frequent and some ops miss.
        let mut table = EnvTable::new(4, false);
        let mut issued = Vec::new();
        for op in ops {
            apply(&mut table, op, &mut issued);
        }
        let unique: BTreeSet<u32> = issued.iter().map(|id| id.as_raw()).collect();
        prop_assert_eq!(unique.len(), issued.len());
        prop_assert!(issued.iter().all(|id| id.as_raw() != 0));
        for id in &issued {
            let current = table.slot(id.slot()).map(|env| env.id());
            if current != Some(*id) {
                prop_assert!(table.get(*id).is_none(), "stale {} still resolves", id);
                prop_assert!(table.resolve(DomainId::from_raw(0), id.as_raw(), false).is_err());
            }
        }
    }
}
