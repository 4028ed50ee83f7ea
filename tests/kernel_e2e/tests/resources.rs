// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Devices and exhaustible resources: the loopback NIC, the console, physical
//! frames and domain slots.

use std::sync::Arc;

use axon::abi::layout::PGSIZE;
use axon::abi::{PteFlags, SysError};
use axon::KernelConfig;
use axon_e2e::{HarnessConfig, Machine, DATA};
use axon_libos::{net, sys, ForkError, UserEnv};
use parking_lot::Mutex;

fn with_nic(capacity: usize) -> Machine {
    Machine::new(HarnessConfig { nic_capacity: Some(capacity), ..HarnessConfig::default() }).expect("machine")
}

#[test]
fn transmitted_frames_reach_the_wire() {
    let mut m = with_nic(4);
    m.spawn(|d| {
        let payload: Vec<u8> = (0..2 * net::MAX_FRAME + 100).map(|i| i as u8).collect();
        d.write(DATA, &payload);
        net::transmit(d, DATA, payload.len()).expect("transmit");
    })
    .expect("spawn");
    m.run().expect("run");

    let nic = m.kernel().platform().nic.as_ref().expect("nic");
    let frames = nic.drain_tx();
    assert_eq!(frames.iter().map(Vec::len).collect::<Vec<_>>(), [net::MAX_FRAME, net::MAX_FRAME, 100]);
    assert_eq!(frames[1][0], net::MAX_FRAME as u8);
}

#[test]
fn full_transmit_ring_reports_busy() {
    let mut m = with_nic(2);
    let results: Arc<Mutex<Vec<Result<(), SysError>>>> = Arc::default();
    let out = results.clone();
    m.spawn(move |d| {
        d.write(DATA, b"frame");
        for _ in 0..3 {
            let r = sys::transmit_packet(d, DATA, 5);
            out.lock().push(r);
        }
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(*results.lock(), [Ok(()), Ok(()), Err(SysError::NicBusy)]);
}

#[test]
fn injected_frame_is_received() {
    let mut m = with_nic(1);
    m.kernel().platform().nic.as_ref().expect("nic").inject_rx(b"ping");
    let got = Arc::new(Mutex::new(Vec::new()));
    let out = got.clone();
    m.spawn(move |d| {
        let n = net::receive(d, DATA, net::MAX_FRAME).expect("receive");
        let mut buf = vec![0u8; n];
        d.read(DATA, &mut buf);
        *out.lock() = buf;
        assert_eq!(sys::receive_packet(d, DATA, 16), Err(SysError::RxEmpty));
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(*got.lock(), b"ping");
}

#[test]
fn machine_without_nic_refuses_packets() {
    let mut m = Machine::new(HarnessConfig::default()).expect("machine");
    let results: Arc<Mutex<Vec<SysError>>> = Arc::default();
    let out = results.clone();
    m.spawn(move |d| {
        let mut r = out.lock();
        r.extend(net::transmit(d, DATA, 10).err());
        r.extend(sys::receive_packet(d, DATA, 10).err());
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(*results.lock(), [SysError::NoNic, SysError::NoNic]);
}

#[test]
fn console_round_trip() {
    let mut m = Machine::new(HarnessConfig::default()).expect("machine");
    m.kernel().platform().console.push_input(b"k");
    let got = Arc::new(Mutex::new(Vec::new()));
    let out = got.clone();
    m.spawn(move |d| {
        let mut r = out.lock();
        r.push(sys::cgetc(d).expect("cgetc"));
        r.push(sys::cgetc(d).expect("cgetc"));
        d.write(DATA, b"hello, console\n");
        sys::cputs(d, DATA, 15).expect("cputs");
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(*got.lock(), [Some(b'k'), None]);
    assert!(m.console().contains("hello, console\n"));
}

#[test]
fn page_alloc_reports_exhaustion() {
    // Text, four data pages and the stack use six frames.
    let config = HarnessConfig { frame_limit: Some(8), ..HarnessConfig::default() };
    let mut m = Machine::new(config).expect("machine");
    let results: Arc<Mutex<Vec<Result<(), SysError>>>> = Arc::default();
    let out = results.clone();
    m.spawn(move |d| {
        let mut r = out.lock();
        for i in 0..3 {
            r.push(sys::page_alloc(d, sys::SELF, 0x00a0_0000 + i * PGSIZE, PteFlags::USER_RW));
        }
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(*results.lock(), [Ok(()), Ok(()), Err(SysError::NoMem)]);
    assert_eq!(m.kernel().platform().frames.live(), 0);
}

#[test]
fn fork_reports_a_full_domain_table() {
    let config = HarnessConfig {
        kernel: KernelConfig::default().with_domain_slots(1).with_transition_log(true),
        ..HarnessConfig::default()
    };
    let mut m = Machine::new(config).expect("machine");
    let result = Arc::new(Mutex::new(None));
    let out = result.clone();
    m.spawn(move |d| {
        *out.lock() = Some(d.fork_with(|_| {}).map(|_| ()));
    })
    .expect("spawn");
    m.run().expect("run");

    assert_eq!(result.lock().take(), Some(Err(ForkError::Exofork(SysError::NoFreeEnv))));
}
