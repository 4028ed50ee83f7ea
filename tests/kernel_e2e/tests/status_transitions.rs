// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Every status change the kernel makes under a mixed workload stays inside
//! the domain state machine, and a drained machine holds no frames.

use std::collections::HashMap;

use axon::abi::layout::PGSIZE;
use axon::abi::EnvStatus;
use axon::env::{transition_allowed, Transition};
use axon::types::DomainId;
use axon_e2e::{Domain, HarnessConfig, Machine, DATA, DATA_PAGES};
use axon_libos::sys;
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    Compute(u32),
    Yield,
    Write { page: u32, value: u32 },
    Fork,
    Time,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..200).prop_map(Op::Compute),
        Just(Op::Yield),
        (0..DATA_PAGES, any::<u32>()).prop_map(|(page, value)| Op::Write { page, value }),
        Just(Op::Fork),
        Just(Op::Time),
    ]
}

fn execute(d: &mut Domain, ops: &[Op]) {
    for (i, op) in ops.iter().enumerate() {
        match *op {
            Op::Compute(n) => d.compute(n),
            Op::Yield => sys::yield_now(d),
            Op::Write { page, value } => {
                d.write_u32(DATA + page * PGSIZE, value);
                assert_eq!(d.read_u32(DATA + page * PGSIZE), value);
            }
            Op::Fork => {
                // The child replays the rest of the script without forking again.
                let rest: Vec<Op> = ops[i + 1..].iter().copied().filter(|op| !matches!(op, Op::Fork)).collect();
                if let Err(err) = d.fork_with(move |c| execute(c, &rest)) {
                    assert_eq!(err.sys_error(), axon::abi::SysError::NoFreeEnv, "{}", err);
                }
            }
            Op::Time => {
                sys::time_msec(d).expect("time");
            }
        }
    }
}

/// Replays the log per domain and checks each step against the state machine.
fn check_log(log: &[Transition]) {
    let mut last: HashMap<DomainId, EnvStatus> = HashMap::new();
    for t in log {
        assert!(transition_allowed(t.from, t.to), "{:?}", t);
        let expected = last.get(&t.domain).copied().unwrap_or(EnvStatus::Free);
        assert_eq!(t.from, expected, "{} jumped from {:?}", t.domain, expected);
        last.insert(t.domain, t.to);
    }
    assert!(last.values().all(|s| *s == EnvStatus::Free), "{:?}", last);
}

#[test]
fn simple_lifecycle_is_recorded() {
    let mut m = Machine::new(HarnessConfig::default()).expect("machine");
    let id = m.spawn(|d| d.compute(10)).expect("spawn");
    m.run().expect("run");

    let log = m.kernel().take_transitions();
    let steps: Vec<(EnvStatus, EnvStatus)> = log.iter().filter(|t| t.domain == id).map(|t| (t.from, t.to)).collect();
    assert_eq!(
        steps,
        [
            (EnvStatus::Free, EnvStatus::Runnable),
            (EnvStatus::Runnable, EnvStatus::Running),
            (EnvStatus::Running, EnvStatus::Dying),
            (EnvStatus::Dying, EnvStatus::Free),
        ]
    );
    assert!(m.kernel().take_transitions().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn mixed_workload_respects_state_machine(
        scripts in proptest::collection::vec(proptest::collection::vec(op(), 1..8), 1..4),
        cpus in 1usize..3,
    ) {
        let config = HarnessConfig {
            kernel: axon::KernelConfig::default().with_cpus(cpus).with_domain_slots(8).with_transition_log(true),
            quantum: Some(32),
            ..HarnessConfig::default()
        };
        let mut m = Machine::new(config).expect("machine");
        for script in scripts {
            m.spawn(move |d| execute(d, &script)).expect("spawn");
        }
        m.run().expect("run");

        check_log(&m.kernel().take_transitions());
        prop_assert!(m.kernel().domains().is_empty());
        prop_assert!(m.handler_errors().is_empty());
        prop_assert_eq!(m.kernel().platform().frames.live(), 0);
    }
}
