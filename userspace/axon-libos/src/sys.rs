// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed wrappers for the system-call surface.
//!
//! Id `0` (see [`SELF`]) names the caller. Every wrapper decodes `eax`
//! through [`SysError::check`].

use axon_abi::{DomainId, EnvStatus, PteFlags, PushRegs, SysError, SysResult, Syscall};

use crate::UserEnv;

/// The calling domain.
pub const SELF: DomainId = DomainId::from_raw(0);

fn call<E: UserEnv>(env: &mut E, number: Syscall, args: [u32; 5]) -> SysResult<u32> {
    SysError::check(env.syscall(number, args).eax as i32)
}

fn unit(ret: SysResult<u32>) -> SysResult<()> {
    ret.map(|_| ())
}

/// Prints `len` bytes at `va` on the console.
pub fn cputs<E: UserEnv>(env: &mut E, va: u32, len: usize) -> SysResult<()> {
    unit(call(env, Syscall::Cputs, [va, len as u32, 0, 0, 0]))
}

/// Next console character, if one is buffered.
pub fn cgetc<E: UserEnv>(env: &mut E) -> SysResult<Option<u8>> {
    call(env, Syscall::Cgetc, [0; 5]).map(|c| (c != 0).then_some(c as u8))
}

pub fn getenvid<E: UserEnv>(env: &mut E) -> SysResult<DomainId> {
    call(env, Syscall::GetEnvId, [0; 5]).map(DomainId::from_raw)
}

pub fn env_destroy<E: UserEnv>(env: &mut E, id: DomainId) -> SysResult<()> {
    unit(call(env, Syscall::EnvDestroy, [id.as_raw(), 0, 0, 0, 0]))
}

/// Maps a fresh zeroed page at `va` in `id`.
pub fn page_alloc<E: UserEnv>(env: &mut E, id: DomainId, va: u32, perm: PteFlags) -> SysResult<()> {
    unit(call(env, Syscall::PageAlloc, [id.as_raw(), va, perm.bits(), 0, 0]))
}

/// Maps the page at `src_va` in `src` into `dst` at `dst_va`.
pub fn page_map<E: UserEnv>(
    env: &mut E,
    src: DomainId,
    src_va: u32,
    dst: DomainId,
    dst_va: u32,
    perm: PteFlags,
) -> SysResult<()> {
    unit(call(env, Syscall::PageMap, [src.as_raw(), src_va, dst.as_raw(), dst_va, perm.bits()]))
}

pub fn page_unmap<E: UserEnv>(env: &mut E, id: DomainId, va: u32) -> SysResult<()> {
    unit(call(env, Syscall::PageUnmap, [id.as_raw(), va, 0, 0, 0]))
}

/// Creates a child with a copy of the caller's registers and no memory.
///
/// Returns the child's id in the parent and [`SELF`] in the child.
pub fn exofork<E: UserEnv>(env: &mut E) -> SysResult<DomainId> {
    call(env, Syscall::Exofork, [0; 5]).map(DomainId::from_raw)
}

pub fn env_set_status<E: UserEnv>(env: &mut E, id: DomainId, status: EnvStatus) -> SysResult<()> {
    unit(call(env, Syscall::EnvSetStatus, [id.as_raw(), status.raw(), 0, 0, 0]))
}

/// Replaces the registers of `id` with the trap frame stored at `frame_va`.
pub fn env_set_trapframe<E: UserEnv>(env: &mut E, id: DomainId, frame_va: u32) -> SysResult<()> {
    unit(call(env, Syscall::EnvSetTrapframe, [id.as_raw(), frame_va, 0, 0, 0]))
}

pub fn env_set_pgfault_upcall<E: UserEnv>(env: &mut E, id: DomainId, entry: u32) -> SysResult<()> {
    unit(call(env, Syscall::EnvSetPgfaultUpcall, [id.as_raw(), entry, 0, 0, 0]))
}

/// Gives up the CPU.
pub fn yield_now<E: UserEnv>(env: &mut E) {
    let _ = env.syscall(Syscall::Yield, [0; 5]);
}

/// Offers `value` and optionally the page at `src_va` to `to`. Never blocks.
pub fn ipc_try_send<E: UserEnv>(env: &mut E, to: DomainId, value: u32, src_va: u32, perm: PteFlags) -> SysResult<()> {
    unit(call(env, Syscall::IpcTrySend, [to.as_raw(), value, src_va, perm.bits(), 0]))
}

/// Blocks until a send arrives. Returns the raw registers carrying the message.
pub fn ipc_recv<E: UserEnv>(env: &mut E, dst_va: u32, max_perm: PteFlags) -> SysResult<PushRegs> {
    let regs = env.syscall(Syscall::IpcRecv, [dst_va, max_perm.bits(), 0, 0, 0]);
    SysError::check(regs.eax as i32).map(|_| regs)
}

/// Milliseconds since boot.
pub fn time_msec<E: UserEnv>(env: &mut E) -> SysResult<u32> {
    call(env, Syscall::TimeMsec, [0; 5])
}

/// Hands one frame of `len` bytes at `va` to the NIC.
pub fn transmit_packet<E: UserEnv>(env: &mut E, va: u32, len: usize) -> SysResult<()> {
    unit(call(env, Syscall::TransmitPacket, [va, len as u32, 0, 0, 0]))
}

/// Copies one received frame to `va`; returns its length.
pub fn receive_packet<E: UserEnv>(env: &mut E, va: u32, max_len: usize) -> SysResult<usize> {
    call(env, Syscall::ReceivePacket, [va, max_len as u32, 0, 0, 0]).map(|n| n as usize)
}
