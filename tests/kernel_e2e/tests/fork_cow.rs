// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fork observed from both sides of the fork.

use std::sync::Arc;

use axon::abi::layout::{PGSIZE, PTSIZE};
use axon::abi::PteFlags;
use axon::types::DomainId;
use axon_e2e::{HarnessConfig, Machine, DATA, DATA_PAGES, TEXT};
use axon_libos::{ipc_recv, ipc_send, ForkOutcome, Layout};
use parking_lot::Mutex;

fn machine() -> Machine {
    Machine::new(HarnessConfig::default()).expect("machine")
}

/// Every present user page of `id` below the exception stack, in address order.
fn user_pages(m: &Machine, id: DomainId) -> Vec<(u32, PteFlags)> {
    let k = m.kernel();
    let xstack = Layout { user_top: k.config().user_top }.exception_stack_page();
    let mut pages = Vec::new();
    let mut va = 0u32;
    while va < k.config().user_top {
        if !k.table_present(id, va) {
            va += PTSIZE;
            continue;
        }
        if let Some(flags) = k.mapping(id, va) {
            if va != xstack {
                pages.push((va, flags));
            }
        }
        va += PGSIZE;
    }
    pages
}

fn assert_no_writable_cow(m: &Machine) {
    for id in m.kernel().domains() {
        for (va, flags) in user_pages(m, id) {
            assert!(!(flags.is_cow() && flags.contains(PteFlags::W)), "{} maps {:08x} as {:?}", id, va, flags);
        }
    }
}

#[test]
fn child_write_stays_private() {
    let mut m = machine();
    let child_id = Arc::new(Mutex::new(None));
    let slot = child_id.clone();
    let parent = m
        .spawn(move |d| {
            d.write_u32(DATA, 0xaaaa);
            let me = d.id();
            let outcome = d
                .fork_with(move |c| {
                    assert_eq!(c.read_u32(DATA), 0xaaaa);
                    c.write_u32(DATA, 0xbbbb);
                    assert_eq!(c.read_u32(DATA), 0xbbbb);
                    ipc_send(c, me, 1, None).expect("report to parent");
                    let _ = ipc_recv(c, None);
                })
                .expect("fork");
            let ForkOutcome::Parent(child) = outcome else {
                panic!("parent resumed as child");
            };
            *slot.lock() = Some(child);
            let msg = ipc_recv(d, None).expect("child report");
            assert_eq!(msg.from, child);
            assert_eq!(d.read_u32(DATA), 0xaaaa);
            let _ = ipc_recv(d, None);
        })
        .expect("spawn");
    m.run().expect("run");

    let child = child_id.lock().expect("fork ran");
    let k = m.kernel();
    assert_eq!(k.read_user(parent, DATA, 4), Some(0xaaaau32.to_le_bytes().to_vec()));
    assert_eq!(k.read_user(child, DATA, 4), Some(0xbbbbu32.to_le_bytes().to_vec()));

    // The child's store split the page; the parent is the sole owner again.
    let parent_flags = k.mapping(parent, DATA).expect("parent data");
    assert!(parent_flags.contains(PteFlags::W) && !parent_flags.is_cow());
    let child_flags = k.mapping(child, DATA).expect("child data");
    assert!(child_flags.contains(PteFlags::W) && !child_flags.is_cow());
    let a = k.translate(parent, DATA, false).expect("parent page");
    let b = k.translate(child, DATA, false).expect("child page");
    assert!(!a.same_frame(&b));
    assert_no_writable_cow(&m);
}

#[test]
fn child_starts_with_the_parents_pages() {
    let mut m = machine();
    let child_id = Arc::new(Mutex::new(None));
    let slot = child_id.clone();
    let parent = m
        .spawn(move |d| {
            for i in 0..DATA_PAGES {
                d.write_u32(DATA + i * PGSIZE, 0x100 + i);
            }
            let outcome = d
                .fork_with(|c| {
                    let _ = ipc_recv(c, None);
                })
                .expect("fork");
            if let ForkOutcome::Parent(child) = outcome {
                *slot.lock() = Some(child);
            }
            let _ = ipc_recv(d, None);
        })
        .expect("spawn");
    m.run().expect("run");

    let child = child_id.lock().expect("fork ran");
    let k = m.kernel();
    let parent_pages = user_pages(&m, parent);
    let child_pages = user_pages(&m, child);
    assert_eq!(
        parent_pages.iter().map(|(va, _)| *va).collect::<Vec<_>>(),
        child_pages.iter().map(|(va, _)| *va).collect::<Vec<_>>()
    );
    for ((va, pf), (_, cf)) in parent_pages.iter().zip(&child_pages) {
        assert_eq!(pf, cf, "flags differ at {:08x}", va);
        let a = k.translate(parent, *va, false).expect("parent page");
        let b = k.translate(child, *va, false).expect("child page");
        assert!(a.same_frame(&b), "{:08x} not shared", va);
    }
    // Text stays read-only; data pages became COW on both sides.
    assert_eq!(k.mapping(child, TEXT), Some(PteFlags::USER_REQUIRED));
    for i in 0..DATA_PAGES {
        let flags = k.mapping(child, DATA + i * PGSIZE).expect("data page");
        assert!(flags.is_cow() && !flags.contains(PteFlags::W));
        assert_eq!(k.read_user(child, DATA + i * PGSIZE, 4), Some((0x100 + i).to_le_bytes().to_vec()));
    }

    // The exception stack is never shared.
    let xstack = Layout { user_top: k.config().user_top }.exception_stack_page();
    let a = k.translate(parent, xstack, true).expect("parent xstack");
    let b = k.translate(child, xstack, true).expect("child xstack");
    assert!(!a.same_frame(&b));
    assert_no_writable_cow(&m);
}

#[test]
fn parent_write_after_fork_leaves_child_copy() {
    let mut m = machine();
    let child_id = Arc::new(Mutex::new(None));
    let slot = child_id.clone();
    let parent = m
        .spawn(move |d| {
            d.write_u32(DATA + PGSIZE, 5);
            if let ForkOutcome::Parent(child) = d.fork_with(|c| {
                let _ = ipc_recv(c, None);
            })
            .expect("fork")
            {
                *slot.lock() = Some(child);
            }
            d.write_u32(DATA + PGSIZE, 6);
            let _ = ipc_recv(d, None);
        })
        .expect("spawn");
    m.run().expect("run");

    let child = child_id.lock().expect("fork ran");
    let k = m.kernel();
    assert_eq!(k.read_user(parent, DATA + PGSIZE, 4), Some(6u32.to_le_bytes().to_vec()));
    assert_eq!(k.read_user(child, DATA + PGSIZE, 4), Some(5u32.to_le_bytes().to_vec()));
    assert!(m.handler_errors().is_empty());
    assert_no_writable_cow(&m);
}

#[test]
fn grandchild_shares_cow_pages_with_both_ancestors() {
    let mut m = machine();
    let ids = Arc::new(Mutex::new(Vec::new()));
    let log = ids.clone();
    m.spawn(move |d| {
        d.write_u32(DATA, 1);
        let log2 = log.clone();
        let _ = d
            .fork_with(move |c| {
                c.write_u32(DATA, 2);
                let log3 = log2.clone();
                let _ = c
                    .fork_with(move |g| {
                        log3.lock().push(("grandchild", g.read_u32(DATA)));
                        g.write_u32(DATA, 3);
                        log3.lock().push(("grandchild", g.read_u32(DATA)));
                    })
                    .expect("second fork");
                c.compute(200);
                log2.lock().push(("child", c.read_u32(DATA)));
            })
            .expect("first fork");
        d.compute(400);
        log.lock().push(("parent", d.read_u32(DATA)));
    })
    .expect("spawn");
    m.run().expect("run");

    let seen = ids.lock().clone();
    assert!(seen.contains(&("grandchild", 2)));
    assert!(seen.contains(&("grandchild", 3)));
    assert!(seen.contains(&("child", 2)));
    assert!(seen.contains(&("parent", 1)));
    assert!(m.kernel().domains().is_empty());
    assert!(m.handler_errors().is_empty());
}

#[test]
fn both_sides_write_the_shared_page_under_preemption() {
    // Offsets around the quantum put the preemption between the fault and the
    // handler's look at the page table, after which the other side splits first.
    for work in 24..40 {
        let mut m = Machine::new(HarnessConfig { quantum: Some(32), ..HarnessConfig::default() }).expect("machine");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        m.spawn(move |d| {
            d.write_u32(DATA, 1);
            let child_out = out.clone();
            d.fork_with(move |c| {
                c.compute(work);
                c.write_u32(DATA, 3);
                child_out.lock().push(("child", c.read_u32(DATA)));
            })
            .expect("fork");
            d.compute(work);
            d.write_u32(DATA, 2);
            out.lock().push(("parent", d.read_u32(DATA)));
        })
        .expect("spawn");
        m.run().expect("run");

        assert!(m.handler_errors().is_empty(), "work {}: {:?}", work, m.handler_errors());
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, [("child", 3), ("parent", 2)], "work {}", work);
        assert_eq!(m.kernel().platform().frames.live(), 0);
    }
}
