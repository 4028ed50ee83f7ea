// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, ipc, mm::{user, AddressSpace}, hal collaborators
//! INVARIANTS: Decode -> Check -> Execute; privileged operations on another domain require parent/child;
//!             a displaced mapping is always settled so no COW page is left with a single owner;
//!             installing a COW mapping seals every writable mapping of the same frame
//! ADR: docs/adr/0001-execution-core-boundaries.md

use alloc::string::String;
use alloc::vec;

use axon_abi::{EnvStatus, PteFlags, Syscall};

use super::{Args, Error, SysResult, SyscallTable};
use crate::config::KernelConfig;
use crate::env::{DestroyOutcome, Env, EnvError, EnvTable};
use crate::hal::{Console, FrameAllocator, Nic};
use crate::ipc::{self, Offer, SendPolicy};
use crate::mm::{user, PageRef};
use crate::trap::{LastTrap, TrapFrame};
use crate::types::{CpuId, DomainId, VirtAddr};

use axon_abi::layout::seg::{FL_IF, FL_IOPL_MASK, GD_UD, GD_UT};

/// Largest frame accepted by the packet calls.
pub const MAX_PACKET: usize = 1518;

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub envs: &'a mut EnvTable,
    pub last_trap: &'a mut LastTrap,
    pub caller: DomainId,
    pub cpu: CpuId,
    pub config: &'a KernelConfig,
    pub frames: &'a dyn FrameAllocator,
    pub console: &'a dyn Console,
    pub nic: Option<&'a dyn Nic>,
    pub ticks: u64,
}

impl Context<'_> {
    fn caller_env(&self) -> SysResult<&Env> {
        self.envs.get(self.caller).ok_or(Error::Env(EnvError::BadEnv))
    }

    fn env_mut(&mut self, id: DomainId) -> SysResult<&mut Env> {
        self.envs.get_mut(id).ok_or(Error::Env(EnvError::BadEnv))
    }

    fn resolve(&self, raw: u32, check_perm: bool) -> SysResult<DomainId> {
        Ok(self.envs.resolve(self.caller, raw, check_perm)?)
    }

    fn user_va(&self, raw: u32) -> SysResult<VirtAddr> {
        VirtAddr::user_page(raw, self.config.user_top).ok_or(Error::Inval)
    }

    /// Checks that the caller may touch `[va, va + len)` with `perm`.
    fn assert_user(&self, va: u32, len: usize, perm: PteFlags) -> SysResult<()> {
        user::check(&self.caller_env()?.space, va, len, perm | PteFlags::U).map_err(Error::Fault)
    }

    fn install(&mut self, id: DomainId, va: VirtAddr, page: PageRef, perm: PteFlags) -> SysResult<()> {
        let displaced = self.env_mut(id)?.space.map(va.raw(), page.clone(), perm)?;
        if perm.is_cow() {
            self.envs.seal_cow(&page);
        }
        if let Some(old) = displaced {
            self.envs.settle(&old);
        }
        Ok(())
    }

    /// Destroys `id`, forgetting any diagnostic state if it was reclaimed.
    pub fn destroy(&mut self, id: DomainId) -> SysResult<()> {
        if self.envs.destroy(id, self.cpu)? == DestroyOutcome::Freed {
            self.last_trap.forget(id);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    target: u32,
    va: VirtAddr,
    perm: PteFlags,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(ctx: &Context<'_>, args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: args.get(0),
            va: ctx.user_va(args.get(1))?,
            perm: PteFlags::from_user(args.get(2)).ok_or(Error::Inval)?,
        })
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: u32,
    src_va: VirtAddr,
    dst: u32,
    dst_va: VirtAddr,
    perm: PteFlags,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(ctx: &Context<'_>, args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: args.get(0),
            src_va: ctx.user_va(args.get(1))?,
            dst: args.get(2),
            dst_va: ctx.user_va(args.get(3))?,
            perm: PteFlags::from_user(args.get(4)).ok_or(Error::Inval)?,
        })
    }

    /// Write access can only be granted from a writable source mapping.
    #[inline]
    fn check(&self, source: PteFlags) -> Result<(), Error> {
        if self.perm.contains(PteFlags::W) && !source.contains(PteFlags::W) {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct PacketArgsTyped {
    va: u32,
    len: usize,
}

impl PacketArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { va: args.get(0), len: args.get(1) as usize }
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len > MAX_PACKET {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(Syscall::Cputs, sys_cputs);
    table.register(Syscall::Cgetc, sys_cgetc);
    table.register(Syscall::GetEnvId, sys_getenvid);
    table.register(Syscall::EnvDestroy, sys_env_destroy);
    table.register(Syscall::PageAlloc, sys_page_alloc);
    table.register(Syscall::PageMap, sys_page_map);
    table.register(Syscall::PageUnmap, sys_page_unmap);
    table.register(Syscall::Exofork, sys_exofork);
    table.register(Syscall::EnvSetStatus, sys_env_set_status);
    table.register(Syscall::EnvSetTrapframe, sys_env_set_trapframe);
    table.register(Syscall::EnvSetPgfaultUpcall, sys_env_set_pgfault_upcall);
    table.register(Syscall::Yield, sys_yield);
    table.register(Syscall::IpcTrySend, sys_ipc_try_send);
    table.register(Syscall::IpcRecv, sys_ipc_recv);
    table.register(Syscall::TimeMsec, sys_time_msec);
    table.register(Syscall::TransmitPacket, sys_transmit_packet);
    table.register(Syscall::ReceivePacket, sys_receive_packet);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let (va, len) = (args.get(0), args.get(1) as usize);
    ctx.assert_user(va, len, PteFlags::empty())?;
    let bytes = user::copy_in(&ctx.caller_env()?.space, va, len).map_err(Error::Fault)?;
    ctx.console.print(&String::from_utf8_lossy(&bytes));
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u32> {
    Ok(ctx.console.getc().map_or(0, u32::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u32> {
    Ok(ctx.caller.as_raw())
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), true)?;
    if target == ctx.caller {
        log_info!(target: "env", "[{}] exiting gracefully", ctx.caller);
    } else {
        log_info!(target: "env", "[{}] destroying {}", ctx.caller, target);
    }
    ctx.destroy(target)?;
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let typed = PageAllocArgsTyped::decode(ctx, args)?;
    let target = ctx.resolve(typed.target, true)?;
    let page = ctx.frames.alloc_zeroed().ok_or(Error::NoMem)?;
    ctx.install(target, typed.va, page, typed.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let typed = PageMapArgsTyped::decode(ctx, args)?;
    let src = ctx.resolve(typed.src, true)?;
    let dst = ctx.resolve(typed.dst, true)?;
    let (page, flags) = {
        let env = ctx.envs.get(src).ok_or(Error::Env(EnvError::BadEnv))?;
        let mapping = env.space.lookup(typed.src_va.raw()).ok_or(Error::Inval)?;
        (mapping.page.clone(), mapping.flags)
    };
    typed.check(flags)?;
    ctx.install(dst, typed.dst_va, page, typed.perm)?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), true)?;
    let va = ctx.user_va(args.get(1))?;
    if let Some(old) = ctx.env_mut(target)?.space.unmap(va.raw()) {
        ctx.envs.settle(&old);
    }
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u32> {
    let mut frame = ctx.caller_env()?.frame;
    frame.regs.eax = 0;
    let child = ctx.envs.alloc(Some(ctx.caller), EnvStatus::NotRunnable)?;
    ctx.env_mut(child)?.frame = frame;
    log_debug!(target: "env", "{} exofork -> {}", ctx.caller, child);
    Ok(child.as_raw())
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), true)?;
    if EnvStatus::from_raw(args.get(1)) != Some(EnvStatus::Runnable) {
        return Err(Error::Inval);
    }
    let env = ctx.env_mut(target)?;
    match env.status() {
        EnvStatus::NotRunnable => {
            env.ipc.recving = false;
            ctx.envs.set_status(target, EnvStatus::Runnable);
        }
        EnvStatus::Runnable | EnvStatus::Running => {}
        EnvStatus::Dying | EnvStatus::Free => return Err(Error::Env(EnvError::BadEnv)),
    }
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), true)?;
    let va = args.get(1);
    ctx.assert_user(va, TrapFrame::SIZE, PteFlags::empty())?;
    let bytes = user::copy_in(&ctx.caller_env()?.space, va, TrapFrame::SIZE).map_err(Error::Fault)?;
    let mut frame = TrapFrame::from_le_bytes(&bytes).ok_or(Error::Inval)?;
    frame.cs = GD_UT;
    frame.ds = GD_UD;
    frame.es = GD_UD;
    frame.ss = GD_UD;
    frame.eflags = (frame.eflags | FL_IF) & !FL_IOPL_MASK;
    ctx.env_mut(target)?.frame = frame;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), true)?;
    ctx.env_mut(target)?.upcall = Some(args.get(1));
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u32> {
    ctx.env_mut(ctx.caller)?.frame.regs.eax = 0;
    Err(Error::Reschedule)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let target = ctx.resolve(args.get(0), false).map_err(|_| Error::Ipc(ipc::IpcError::BadEnv))?;
    let offer = Offer::decode(args.get(2), args.get(3), ctx.config.user_top)?;
    let policy = SendPolicy { ceiling: ctx.config.user_top, strict_page_offer: ctx.config.strict_page_offer };
    ipc::try_send(ctx.envs, ctx.caller, target, args.get(1), offer, policy)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    ipc::recv(ctx.envs, ctx.caller, args.get(0), args.get(1), ctx.config.user_top)?;
    Err(Error::Reschedule)
}

fn sys_time_msec(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u32> {
    Ok(ctx.ticks.wrapping_mul(u64::from(ctx.config.ms_per_tick)) as u32)
}

fn sys_transmit_packet(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let nic = ctx.nic.ok_or(Error::NoNic)?;
    let typed = PacketArgsTyped::decode(args);
    typed.check()?;
    ctx.assert_user(typed.va, typed.len, PteFlags::empty())?;
    let packet = user::copy_in(&ctx.caller_env()?.space, typed.va, typed.len).map_err(Error::Fault)?;
    nic.transmit(&packet)?;
    Ok(0)
}

fn sys_receive_packet(ctx: &mut Context<'_>, args: &Args) -> SysResult<u32> {
    let nic = ctx.nic.ok_or(Error::NoNic)?;
    let typed = PacketArgsTyped::decode(args);
    let len = typed.len.min(MAX_PACKET);
    ctx.assert_user(typed.va, len, PteFlags::W)?;
    let mut buf = vec![0u8; len];
    let read = nic.receive(&mut buf)?;
    user::copy_out(&ctx.caller_env()?.space, typed.va, &buf[..read]).map_err(Error::Fault)?;
    Ok(read as u32)
}
