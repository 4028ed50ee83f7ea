// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous IPC between domains: blocking receive, refused sends, page
//! transfer and exactly-once delivery.

use std::sync::Arc;

use axon::abi::{EnvStatus, PteFlags, SysError};
use axon::types::DomainId;
use axon_e2e::{HarnessConfig, Machine, DATA};
use axon_libos::{ipc_recv, ipc_send, sys, IpcMessage};
use parking_lot::Mutex;
use proptest::prelude::*;

const RECV_VA: u32 = 0x00a0_0000;

fn machine() -> Machine {
    Machine::new(HarnessConfig::default()).expect("machine")
}

#[test]
fn blocked_receiver_gets_value_and_sender() {
    let mut m = machine();
    let got: Arc<Mutex<Option<IpcMessage>>> = Arc::default();
    let out = got.clone();
    let receiver = m
        .spawn(move |d| {
            *out.lock() = Some(ipc_recv(d, None).expect("recv"));
        })
        .expect("spawn receiver");
    let send_result: Arc<Mutex<Option<Result<(), SysError>>>> = Arc::default();
    let res = send_result.clone();
    let sender = m
        .spawn(move |d| {
            *res.lock() = Some(sys::ipc_try_send(d, receiver, 42, axon::abi::layout::KERNBASE, PteFlags::empty()));
        })
        .expect("spawn sender");
    m.run().expect("run");

    assert_eq!(*send_result.lock(), Some(Ok(())));
    let msg = got.lock().expect("delivered");
    assert_eq!(msg.value, 42);
    assert_eq!(msg.from, sender);
    assert!(!msg.has_page());
}

#[test]
fn send_to_idle_domain_is_refused_without_side_effects() {
    let mut m = machine();
    let target: Arc<Mutex<Option<DomainId>>> = Arc::default();
    let send_result: Arc<Mutex<Option<Result<(), SysError>>>> = Arc::default();
    let (t, res) = (target.clone(), send_result.clone());
    // Slot order puts the sender first, so the target has not run yet.
    m.spawn(move |d| {
        let to = t.lock().expect("target id");
        *res.lock() = Some(sys::ipc_try_send(d, to, 7, axon::abi::layout::KERNBASE, PteFlags::empty()));
    })
    .expect("spawn sender");
    let idle = m
        .spawn(|d| {
            let _ = ipc_recv(d, None);
        })
        .expect("spawn target");
    *target.lock() = Some(idle);
    m.run().expect("run");

    assert_eq!(*send_result.lock(), Some(Err(SysError::IpcNotRecv)));
    let info = m.kernel().domain(idle).expect("target alive");
    assert_eq!(info.status, EnvStatus::NotRunnable);
    assert!(info.ipc_recving);
    assert_eq!(info.ipc_value, 0);
    assert_eq!(info.ipc_from, None);
}

#[test]
fn page_is_shared_with_receiver() {
    let mut m = machine();
    let got: Arc<Mutex<Option<(IpcMessage, Vec<u8>)>>> = Arc::default();
    let out = got.clone();
    let receiver = m
        .spawn(move |d| {
            let msg = ipc_recv(d, Some(RECV_VA)).expect("recv");
            let mut bytes = [0u8; 5];
            axon_libos::UserEnv::read(d, RECV_VA, &mut bytes);
            d.write_u32(RECV_VA + 8, 0x5eed);
            *out.lock() = Some((msg, bytes.to_vec()));
            let _ = ipc_recv(d, None);
        })
        .expect("spawn receiver");
    let sender = m
        .spawn(move |d| {
            axon_libos::UserEnv::write(d, DATA, b"hello");
            ipc_send(d, receiver, 9, Some((DATA, PteFlags::USER_RW))).expect("send");
            let _ = ipc_recv(d, None);
        })
        .expect("spawn sender");
    m.run().expect("run");

    let (msg, bytes) = got.lock().clone().expect("delivered");
    assert_eq!(msg.value, 9);
    assert_eq!(msg.from, sender);
    assert_eq!(msg.perm, PteFlags::USER_RW);
    assert_eq!(bytes, b"hello");

    let k = m.kernel();
    let a = k.translate(sender, DATA, false).expect("sender page");
    let b = k.translate(receiver, RECV_VA, false).expect("receiver page");
    assert!(a.same_frame(&b));
    assert_eq!(k.read_user(sender, DATA + 8, 4), Some(0x5eedu32.to_le_bytes().to_vec()));
}

#[test]
fn page_offer_without_receive_address_moves_only_the_value() {
    let mut m = machine();
    let got: Arc<Mutex<Option<IpcMessage>>> = Arc::default();
    let out = got.clone();
    let receiver = m
        .spawn(move |d| {
            *out.lock() = Some(ipc_recv(d, None).expect("recv"));
        })
        .expect("spawn receiver");
    m.spawn(move |d| {
        ipc_send(d, receiver, 3, Some((DATA, PteFlags::USER_RW))).expect("send");
    })
    .expect("spawn sender");
    m.run().expect("run");

    let msg = got.lock().expect("delivered");
    assert_eq!(msg.value, 3);
    assert!(!msg.has_page());
}

#[test]
fn one_page_reaches_one_receiver() {
    let mut m = machine();
    let first = m
        .spawn(|d| {
            let _ = ipc_recv(d, Some(RECV_VA));
            let _ = ipc_recv(d, None);
        })
        .expect("spawn first");
    let second = m
        .spawn(|d| {
            let _ = ipc_recv(d, Some(RECV_VA));
        })
        .expect("spawn second");
    m.spawn(move |d| {
        d.write_u32(DATA, 77);
        ipc_send(d, first, 1, Some((DATA, PteFlags::USER_REQUIRED))).expect("send");
        let _ = ipc_recv(d, None);
    })
    .expect("spawn sender");
    m.run().expect("run");

    let k = m.kernel();
    assert_eq!(k.mapping(first, RECV_VA), Some(PteFlags::USER_REQUIRED));
    assert_eq!(k.read_user(first, RECV_VA, 4), Some(77u32.to_le_bytes().to_vec()));
    assert_eq!(k.mapping(second, RECV_VA), None);
    let info = k.domain(second).expect("second alive");
    assert!(info.ipc_recving);
    assert_eq!(info.status, EnvStatus::NotRunnable);
}

#[test]
fn dead_receiver_is_a_bad_target() {
    let mut m = machine();
    let send_result: Arc<Mutex<Option<Result<(), SysError>>>> = Arc::default();
    let res = send_result.clone();
    let gone = m.spawn(|_| {}).expect("spawn short-lived");
    m.spawn(move |d| {
        d.compute(200);
        *res.lock() = Some(ipc_send(d, gone, 1, None));
    })
    .expect("spawn sender");
    m.run().expect("run");

    assert_eq!(*send_result.lock(), Some(Err(SysError::BadEnv)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn every_message_is_delivered_exactly_once(values in proptest::collection::vec(1u32..1000, 1..5)) {
        let mut m = machine();
        let received: Arc<Mutex<Vec<(u32, DomainId)>>> = Arc::default();
        let out = received.clone();
        let count = values.len();
        let receiver = m
            .spawn(move |d| {
                for _ in 0..count {
                    let msg = ipc_recv(d, None).expect("recv");
                    out.lock().push((msg.value, msg.from));
                }
            })
            .expect("spawn receiver");
        let mut expected = Vec::new();
        for value in values {
            let id = m
                .spawn(move |d| {
                    ipc_send(d, receiver, value, None).expect("send");
                })
                .expect("spawn sender");
            expected.push((value, id));
        }
        m.run().expect("run");

        let mut got = received.lock().clone();
        got.sort_by_key(|(v, id)| (id.as_raw(), *v));
        expected.sort_by_key(|(v, id)| (id.as_raw(), *v));
        prop_assert_eq!(got, expected);
        prop_assert!(m.kernel().domains().is_empty());
    }
}
