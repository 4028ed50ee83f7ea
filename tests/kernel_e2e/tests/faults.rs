// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault containment: a misbehaving domain is destroyed, its neighbours keep running.

use std::sync::Arc;

use axon::abi::layout::PGSIZE;
use axon::abi::{EnvStatus, SysError};
use axon::trap::vector::T_BRKPT;
use axon_e2e::{HarnessConfig, Machine, DATA, ENTRY, TEXT};
use axon_libos::{ipc_recv, protect_fault_handler, set_pgfault_handler, sys, UserEnv};
use parking_lot::Mutex;

fn machine() -> Machine {
    Machine::new(HarnessConfig::default()).expect("machine")
}

/// Spawns a domain that does some work and then waits forever.
fn bystander(m: &mut Machine) -> axon::types::DomainId {
    m.spawn(|d| {
        for i in 0..8 {
            d.write_u32(DATA + 4 * i, i);
            d.compute(50);
        }
        let _ = ipc_recv(d, None);
    })
    .expect("spawn bystander")
}

#[test]
fn write_to_read_only_page_without_handler_destroys_domain() {
    let mut m = machine();
    let victim = m
        .spawn(|d| {
            d.write_u32(TEXT, 1);
            panic!("store to text page completed");
        })
        .expect("spawn victim");
    let other = bystander(&mut m);
    m.run().expect("run");

    assert_eq!(m.kernel().status(victim), None);
    assert_eq!(m.kernel().status(other), Some(EnvStatus::NotRunnable));
    assert_eq!(m.kernel().read_user(other, DATA + 28, 4), Some(7u32.to_le_bytes().to_vec()));
    let console = m.console();
    assert!(console.contains(&format!("[{}] user fault va {:08x} ip {:08x}", victim, TEXT, ENTRY)), "{}", console);
}

#[test]
fn handler_refuses_non_cow_write() {
    let mut m = machine();
    let victim = m
        .spawn(|d| {
            set_pgfault_handler(d, protect_fault_handler::<axon_e2e::Domain>).expect("install handler");
            d.write_u32(TEXT + 4, 1);
            panic!("handler repaired a read-only page");
        })
        .expect("spawn victim");
    let other = bystander(&mut m);
    m.run().expect("run");

    assert_eq!(m.kernel().status(victim), None);
    assert_eq!(m.kernel().status(other), Some(EnvStatus::NotRunnable));
    let errors = m.handler_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, victim);
    assert!(errors[0].1.contains("non-cow"), "{}", errors[0].1);
}

#[test]
fn unmapped_access_with_handler_is_fatal() {
    let mut m = machine();
    let victim = m
        .spawn(|d| {
            set_pgfault_handler(d, protect_fault_handler::<axon_e2e::Domain>).expect("install handler");
            let _ = d.read_u32(0x0040_0000);
            panic!("read of unmapped memory completed");
        })
        .expect("spawn victim");
    m.run().expect("run");

    assert_eq!(m.kernel().status(victim), None);
    let errors = m.handler_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.contains("read fault at 00400000"), "{}", errors[0].1);
}

#[test]
fn upcall_record_survives_a_repair() {
    let mut m = machine();
    let ok = Arc::new(Mutex::new(false));
    let flag = ok.clone();
    m.spawn(move |d| {
        set_pgfault_handler(d, protect_fault_handler::<axon_e2e::Domain>).expect("install handler");
        d.write_u32(DATA + PGSIZE, 11);
        // Turn the page into a sole COW mapping by sharing it with ourselves.
        let cow = axon::abi::PteFlags::USER_REQUIRED | axon::abi::PteFlags::COW;
        sys::page_map(d, sys::SELF, DATA + PGSIZE, sys::SELF, DATA + 2 * PGSIZE, cow).expect("alias");
        sys::page_map(d, sys::SELF, DATA + PGSIZE, sys::SELF, DATA + PGSIZE, cow).expect("protect");
        let before = *d.frame();
        d.write_u32(DATA + PGSIZE, 12);
        let after = *d.frame();
        assert_eq!(before.eip, after.eip);
        assert_eq!(before.esp, after.esp);
        assert_eq!(d.read_u32(DATA + PGSIZE), 12);
        assert_eq!(d.read_u32(DATA + 2 * PGSIZE), 11);
        *flag.lock() = true;
    })
    .expect("spawn");
    m.run().expect("run");

    assert!(*ok.lock());
    assert!(m.handler_errors().is_empty());
}

#[test]
fn bad_pointer_to_cputs_destroys_caller() {
    let mut m = machine();
    let victim = m
        .spawn(|d| {
            let _ = sys::cputs(d, 0xf000_0000, 8);
            panic!("cputs returned");
        })
        .expect("spawn victim");
    let talker = m
        .spawn(|d| {
            d.write(DATA, b"still here\n");
            sys::cputs(d, DATA, 11).expect("cputs");
        })
        .expect("spawn talker");
    m.run().expect("run");

    let console = m.console();
    assert!(console.contains(&format!("[{}] user_mem_check assertion failure for va f0000000", victim)), "{}", console);
    assert!(console.contains("still here\n"));
    assert_eq!(m.kernel().status(victim), None);
    assert_eq!(m.kernel().status(talker), None);
}

#[test]
fn breakpoint_enters_monitor_and_resumes() {
    let mut m = machine();
    let resumed = Arc::new(Mutex::new(false));
    let flag = resumed.clone();
    let id = m
        .spawn(move |d| {
            d.raise(T_BRKPT);
            *flag.lock() = true;
        })
        .expect("spawn");
    m.run().expect("run");

    assert!(*resumed.lock());
    let entries = m.kernel().platform().monitor.entries();
    assert_eq!(entries.len(), 1);
    let frame = entries[0].expect("user frame");
    assert_eq!(frame.trapno, T_BRKPT);
    assert_eq!(frame.eip, ENTRY);
    assert_eq!(m.kernel().status(id), None);
}

#[test]
fn operations_on_foreign_domains_are_refused() {
    let mut m = machine();
    let results: Arc<Mutex<Vec<Result<(), SysError>>>> = Arc::default();
    let out = results.clone();
    let stranger = m
        .spawn(|d| {
            let _ = ipc_recv(d, None);
        })
        .expect("spawn stranger");
    m.spawn(move |d| {
        let mut r = out.lock();
        r.push(sys::env_destroy(d, stranger));
        r.push(sys::page_alloc(d, stranger, DATA, axon::abi::PteFlags::USER_RW));
        r.push(sys::env_set_status(d, stranger, EnvStatus::Runnable));
    })
    .expect("spawn meddler");
    m.run().expect("run");

    assert_eq!(*results.lock(), vec![Err(SysError::BadEnv); 3]);
    assert_eq!(m.kernel().status(stranger), Some(EnvStatus::NotRunnable));
}
