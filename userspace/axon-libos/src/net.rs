// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Packet transmit and receive over the NIC system calls.

use axon_abi::SysError;

use crate::sys;
use crate::UserEnv;

/// Largest frame the NIC accepts.
pub const MAX_FRAME: usize = 1518;

/// Sends `len` bytes at `va`, split into NIC-sized frames.
///
/// A full transmit ring is waited out by yielding.
pub fn transmit<E: UserEnv>(env: &mut E, va: u32, len: usize) -> Result<(), SysError> {
    let mut off = 0usize;
    while off < len {
        let n = (len - off).min(MAX_FRAME);
        loop {
            match sys::transmit_packet(env, va + off as u32, n) {
                Err(SysError::NicBusy) => sys::yield_now(env),
                other => {
                    other?;
                    break;
                }
            }
        }
        off += n;
    }
    Ok(())
}

/// Receives one frame into `va`, yielding while the ring is empty.
pub fn receive<E: UserEnv>(env: &mut E, va: u32, max_len: usize) -> Result<usize, SysError> {
    loop {
        match sys::receive_packet(env, va, max_len) {
            Err(SysError::RxEmpty) => sys::yield_now(env),
            other => return other,
        }
    }
}
