// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object: trap entry, dispatch, scheduling decisions and the big kernel lock
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/kernel_e2e
//! PUBLIC API: Kernel (new/create_domain/boot_cpu/trap/step/run_cpu + inspection), Transfer, TrapSource, DomainInfo
//! DEPENDS_ON: env, sched, ipc, fault, syscall, smp, hal::Platform
//! INVARIANTS: All domain state lives behind one lock; interrupts are asserted off on every entry;
//!             a DYING domain is reclaimed only at the top or bottom of a trap on the CPU it ran on;
//!             every trap ends in exactly one Transfer

use alloc::vec::Vec;
use core::fmt::Write as _;

use axon_abi::{EnvStatus, FaultCode, PteFlags, SysError};
use spin::Mutex;

use crate::config::{ConfigError, KernelConfig, MAX_CPUS};
use crate::env::{DestroyOutcome, EnvTable, Transition};
use crate::fault::{self, Unhandled};
use crate::hal::{ConsoleWriter, Platform};
use crate::loader::{self, CreateError, ProgramImage};
use crate::mm::{user, PageRef};
use crate::sched;
use crate::smp::{CpuStatus, PerCpu, TaskState};
use crate::syscall::api::{self, Context};
use crate::syscall::{Args, Error, SyscallTable};
use crate::trap::{fmt_trap, Exception, Interrupt, LastTrap, TrapFrame, TrapKind};
use crate::types::{CpuId, DomainId};

/// What the CPU does when the kernel is done with a trap.
#[must_use = "a transfer must be carried out by the CPU"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// Drop to user privilege in `domain` with `frame`.
    Enter { domain: DomainId, frame: TrapFrame },
    /// Resume interrupted kernel code.
    Return(TrapFrame),
    /// Halt until the next interrupt.
    Halt,
}

/// The processor side of a CPU: carries out a transfer and reports the next trap.
pub trait TrapSource {
    /// Runs `domain` from `frame` until it traps.
    fn enter_user(&mut self, cpu: CpuId, domain: DomainId, frame: &TrapFrame) -> TrapFrame;
    /// Returns to kernel code at `frame` until it traps.
    fn resume_kernel(&mut self, cpu: CpuId, frame: &TrapFrame) -> TrapFrame;
    /// Halts until an interrupt arrives.
    fn wait_for_interrupt(&mut self, cpu: CpuId) -> TrapFrame;
}

/// Snapshot of one domain for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: DomainId,
    pub parent: Option<DomainId>,
    pub status: EnvStatus,
    pub upcall: Option<u32>,
    pub cpu: Option<CpuId>,
    pub runs: u32,
    pub mapped_pages: usize,
    pub ipc_recving: bool,
    pub ipc_value: u32,
    pub ipc_from: Option<DomainId>,
    pub ipc_perm: PteFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    /// Return to the interrupted domain.
    Resume,
    /// Pick another domain.
    Reschedule,
}

struct KernelState {
    config: KernelConfig,
    envs: EnvTable,
    current: [Option<DomainId>; MAX_CPUS],
    ticks: u64,
    last_trap: LastTrap,
    syscalls: SyscallTable,
    idle_reported: bool,
}

static_assertions::assert_impl_all!(KernelState: Send);

/// The execution core built over a platform `P`.
pub struct Kernel<P: Platform> {
    platform: P,
    cpus: [PerCpu; MAX_CPUS],
    state: Mutex<KernelState>,
}

impl<P: Platform> Kernel<P> {
    /// Validates `config` and builds an empty kernel.
    pub fn new(platform: P, config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        log_info!(target: "kernel", "axon: {} cpu(s), {} domain slots", config.cpus, config.domain_slots);
        Ok(Self {
            platform,
            cpus: core::array::from_fn(|i| PerCpu::new(CpuId::from_raw(i as u8))),
            state: Mutex::new(KernelState {
                config,
                envs: EnvTable::new(config.domain_slots, config.record_transitions),
                current: [None; MAX_CPUS],
                ticks: 0,
                last_trap: LastTrap::new(),
                syscalls,
                idle_reported: false,
            }),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> KernelConfig {
        self.state.lock().config
    }

    /// Creates a RUNNABLE domain from a program image.
    pub fn create_domain(&self, image: &ProgramImage<'_>) -> Result<DomainId, CreateError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        loader::create(&mut st.envs, self.platform.frames(), &st.config, image)
    }

    /// First scheduling decision of a CPU.
    pub fn boot_cpu(&self, cpu: CpuId) -> Transfer {
        self.check_cpu(cpu);
        self.cpus[cpu.as_index()].swap_status(CpuStatus::Started);
        log_info!(target: "kernel", "cpu {} started", cpu);
        let mut guard = self.state.lock();
        self.schedule(&mut guard, cpu)
    }

    /// Single entry point for every privileged transfer on `cpu`.
    ///
    /// # Panics
    /// On a kernel page fault, an unexpected trap at kernel privilege,
    /// double-fault-class exceptions, or if interrupts are enabled.
    pub fn trap(&self, cpu: CpuId, frame: TrapFrame) -> Transfer {
        self.check_cpu(cpu);
        let was_halted = self.cpus[cpu.as_index()].swap_status(CpuStatus::Started) == CpuStatus::Halted;
        if self.platform.cpu().interrupts_enabled(cpu) {
            panic!("cpu {}: interrupts enabled on trap entry", cpu);
        }
        if !frame.from_user() && !was_halted {
            return self.kernel_trap(cpu, frame);
        }

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let owner = if frame.from_user() {
            match st.current[cpu.as_index()] {
                Some(id) => Some(id),
                None => panic!("cpu {}: user trap with no current domain", cpu),
            }
        } else {
            None
        };
        if let Some(id) = owner {
            match st.envs.get_mut(id) {
                Some(env) if env.status() == EnvStatus::Dying => {
                    self.reap(st, cpu, id);
                    return self.schedule(st, cpu);
                }
                Some(env) => env.frame = frame,
                None => panic!("cpu {}: current domain {} vanished", cpu, id),
            }
        }
        st.last_trap.record(owner, &frame);

        let flow = self.dispatch(st, cpu, owner, &frame);

        let Some(id) = owner else {
            return self.schedule(st, cpu);
        };
        let status = st.envs.get(id).map(|env| env.status());
        match (status, flow) {
            (Some(EnvStatus::Dying), _) => {
                self.reap(st, cpu, id);
                self.schedule(st, cpu)
            }
            (Some(EnvStatus::Running), Flow::Resume) => {
                let frame = st.envs.get(id).map(|env| env.frame).unwrap_or(frame);
                Transfer::Enter { domain: id, frame }
            }
            _ => self.schedule(st, cpu),
        }
    }

    /// Carries out `transfer` on `hw` and handles the trap that ends it.
    pub fn step<T: TrapSource>(&self, cpu: CpuId, transfer: Transfer, hw: &mut T) -> Transfer {
        let frame = match transfer {
            Transfer::Enter { domain, frame } => hw.enter_user(cpu, domain, &frame),
            Transfer::Return(frame) => hw.resume_kernel(cpu, &frame),
            Transfer::Halt => hw.wait_for_interrupt(cpu),
        };
        self.trap(cpu, frame)
    }

    /// Runs `cpu` forever.
    pub fn run_cpu<T: TrapSource>(&self, cpu: CpuId, hw: &mut T) -> ! {
        let mut transfer = self.boot_cpu(cpu);
        loop {
            transfer = self.step(cpu, transfer, hw);
        }
    }

    fn check_cpu(&self, cpu: CpuId) {
        let cpus = self.state.lock().config.cpus;
        assert!(cpu.as_index() < cpus, "cpu {} not configured", cpu);
    }

    fn kernel_trap(&self, cpu: CpuId, frame: TrapFrame) -> Transfer {
        match frame.kind() {
            TrapKind::Exception(Exception::PageFault) => {
                self.print_frame(cpu, &frame, true);
                panic!("kernel page fault va {:08x} ip {:08x}", frame.fault_va, frame.eip);
            }
            TrapKind::Exception(Exception::Breakpoint | Exception::Debug) => {
                self.platform.monitor().enter(Some(&frame));
                Transfer::Return(frame)
            }
            _ => {
                self.print_frame(cpu, &frame, true);
                panic!("unhandled trap {} in kernel", frame.trapno);
            }
        }
    }

    fn dispatch(&self, st: &mut KernelState, cpu: CpuId, owner: Option<DomainId>, frame: &TrapFrame) -> Flow {
        match frame.kind() {
            TrapKind::Exception(Exception::PageFault) => {
                let Some(id) = owner else {
                    panic!("kernel page fault va {:08x} ip {:08x}", frame.fault_va, frame.eip);
                };
                self.page_fault(st, cpu, id, frame)
            }
            TrapKind::Exception(Exception::Breakpoint | Exception::Debug) => {
                self.platform.monitor().enter(Some(frame));
                Flow::Resume
            }
            TrapKind::Exception(Exception::DoubleFault | Exception::MachineCheck) => {
                self.print_frame(cpu, frame, true);
                panic!("fatal exception {} on cpu {}", frame.trapno, cpu);
            }
            TrapKind::Syscall => match owner {
                Some(caller) => self.syscall(st, cpu, caller, frame),
                None => panic!("system call from kernel on cpu {}", cpu),
            },
            TrapKind::Interrupt(Interrupt::Timer) => {
                self.platform.irq().eoi(cpu);
                st.ticks += 1;
                Flow::Reschedule
            }
            TrapKind::Interrupt(Interrupt::Keyboard) => {
                self.platform.console().keyboard_intr();
                self.platform.irq().eoi(cpu);
                Flow::Resume
            }
            TrapKind::Interrupt(Interrupt::Serial) => {
                self.platform.console().serial_intr();
                self.platform.irq().eoi(cpu);
                Flow::Resume
            }
            TrapKind::Interrupt(Interrupt::Spurious | Interrupt::Error) => {
                log_warn!(target: "trap", "spurious interrupt on irq {}", frame.trapno - crate::trap::vector::IRQ_OFFSET);
                self.print_frame(cpu, frame, st.last_trap.is_latest(frame));
                Flow::Resume
            }
            TrapKind::Exception(_) | TrapKind::Interrupt(Interrupt::Line(_)) | TrapKind::Unknown(_) => {
                self.print_frame(cpu, frame, st.last_trap.is_latest(frame));
                match owner {
                    Some(id) => {
                        self.destroy(st, cpu, id);
                        Flow::Reschedule
                    }
                    None => panic!("unhandled trap {} in kernel", frame.trapno),
                }
            }
        }
    }

    fn page_fault(&self, st: &mut KernelState, cpu: CpuId, id: DomainId, frame: &TrapFrame) -> Flow {
        let xtop = st.config.exception_stack_top();
        match fault::deliver(&mut st.envs, id, frame, xtop) {
            Ok(()) => Flow::Resume,
            Err(why) => {
                if let Unhandled::BadStack(va) = why {
                    log_debug!(target: "trap", "{} fault record at {:08x} rejected", id, va);
                }
                let mut out = ConsoleWriter(self.platform.console());
                let _ = writeln!(out, "[{}] user fault va {:08x} ip {:08x}", id, frame.fault_va, frame.eip);
                self.print_frame(cpu, frame, true);
                self.destroy(st, cpu, id);
                Flow::Reschedule
            }
        }
    }

    fn syscall(&self, st: &mut KernelState, cpu: CpuId, caller: DomainId, frame: &TrapFrame) -> Flow {
        let (number, regs) = frame.syscall_regs();
        let result = {
            let mut ctx = Context {
                envs: &mut st.envs,
                last_trap: &mut st.last_trap,
                caller,
                cpu,
                config: &st.config,
                frames: self.platform.frames(),
                console: self.platform.console(),
                nic: self.platform.nic(),
                ticks: st.ticks,
            };
            st.syscalls.dispatch(number, &mut ctx, &Args::new(regs))
        };
        let ret = match result {
            Ok(value) => value,
            Err(Error::Reschedule) => return Flow::Reschedule,
            Err(Error::Fault(va)) => {
                let mut out = ConsoleWriter(self.platform.console());
                let _ = writeln!(out, "[{}] user_mem_check assertion failure for va {:08x}", caller, va);
                self.destroy(st, cpu, caller);
                return Flow::Reschedule;
            }
            Err(err) => {
                log_debug!(target: "syscall", "{} call {} failed: {}", caller, number, err);
                err.sys_error().map_or(SysError::Unspecified.errno(), SysError::errno) as u32
            }
        };
        if let Some(env) = st.envs.get_mut(caller) {
            env.frame.regs.eax = ret;
        }
        Flow::Resume
    }

    fn destroy(&self, st: &mut KernelState, cpu: CpuId, id: DomainId) {
        if let Ok(DestroyOutcome::Freed) = st.envs.destroy(id, cpu) {
            st.last_trap.forget(id);
        }
    }

    fn reap(&self, st: &mut KernelState, cpu: CpuId, id: DomainId) {
        let released = st.envs.free(id);
        st.last_trap.forget(id);
        if st.current[cpu.as_index()] == Some(id) {
            st.current[cpu.as_index()] = None;
        }
        log_debug!(target: "env", "reclaimed {} ({} mappings) on cpu {}", id, released, cpu);
    }

    fn schedule(&self, st: &mut KernelState, cpu: CpuId) -> Transfer {
        let prev = st.current[cpu.as_index()];
        match sched::pick_next(&st.envs, prev, cpu) {
            Some(next) => self.run(st, cpu, prev, next),
            None => self.halt(st, cpu),
        }
    }

    fn run(&self, st: &mut KernelState, cpu: CpuId, prev: Option<DomainId>, next: DomainId) -> Transfer {
        if let Some(prev) = prev.filter(|p| *p != next) {
            if st.envs.get(prev).map(|env| env.status()) == Some(EnvStatus::Running) {
                st.envs.set_status(prev, EnvStatus::Runnable);
            }
        }
        st.envs.set_status(next, EnvStatus::Running);
        st.current[cpu.as_index()] = Some(next);
        st.idle_reported = false;
        let Some(env) = st.envs.get_mut(next) else {
            panic!("scheduled domain {} vanished", next);
        };
        env.cpu = Some(cpu);
        env.runs += 1;
        log_trace!(target: "sched", "cpu {} -> {}", cpu, next);
        Transfer::Enter { domain: next, frame: env.frame }
    }

    fn halt(&self, st: &mut KernelState, cpu: CpuId) -> Transfer {
        st.current[cpu.as_index()] = None;
        if sched::system_idle(&st.envs) && !st.idle_reported {
            st.idle_reported = true;
            log_info!(target: "sched", "no runnable environments in the system");
        }
        self.cpus[cpu.as_index()].swap_status(CpuStatus::Halted);
        Transfer::Halt
    }

    fn print_frame(&self, cpu: CpuId, frame: &TrapFrame, latest: bool) {
        let _ = fmt_trap(frame, cpu, latest, &mut ConsoleWriter(self.platform.console()));
    }

    // Inspection.

    pub fn status(&self, id: DomainId) -> Option<EnvStatus> {
        self.state.lock().envs.get(id).map(|env| env.status())
    }

    pub fn domain(&self, id: DomainId) -> Option<DomainInfo> {
        let st = self.state.lock();
        let env = st.envs.get(id)?;
        Some(DomainInfo {
            id: env.id(),
            parent: env.parent(),
            status: env.status(),
            upcall: env.upcall,
            cpu: env.cpu,
            runs: env.runs,
            mapped_pages: env.space.mapped_pages(),
            ipc_recving: env.ipc.recving,
            ipc_value: env.ipc.value,
            ipc_from: env.ipc.from,
            ipc_perm: env.ipc.perm,
        })
    }

    /// Every live domain in slot order.
    pub fn domains(&self) -> Vec<DomainId> {
        self.state.lock().envs.live().map(|env| env.id()).collect()
    }

    /// Domain currently running on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<DomainId> {
        self.state.lock().current[cpu.as_index()]
    }

    /// MMU view of a user access. A missing domain faults like an unmapped page.
    pub fn translate(&self, id: DomainId, va: u32, write: bool) -> Result<PageRef, FaultCode> {
        let st = self.state.lock();
        let Some(env) = st.envs.get(id) else {
            let mut code = FaultCode::USER;
            code.set(FaultCode::WRITE, write);
            return Err(code);
        };
        env.space.translate(va, write).cloned()
    }

    /// Permission bits of the mapping at `va`, as the user page-table view shows them.
    pub fn mapping(&self, id: DomainId, va: u32) -> Option<PteFlags> {
        self.state.lock().envs.get(id)?.space.flags(va)
    }

    /// True if the directory entry covering `va` is present.
    pub fn table_present(&self, id: DomainId, va: u32) -> bool {
        self.state.lock().envs.get(id).is_some_and(|env| env.space.table_present(va))
    }

    /// Reads mapped user memory regardless of permissions.
    pub fn read_user(&self, id: DomainId, va: u32, len: usize) -> Option<Vec<u8>> {
        let st = self.state.lock();
        user::copy_in(&st.envs.get(id)?.space, va, len).ok()
    }

    /// Writes mapped user memory regardless of permissions.
    pub fn write_user(&self, id: DomainId, va: u32, data: &[u8]) -> bool {
        let st = self.state.lock();
        st.envs.get(id).is_some_and(|env| user::copy_out(&env.space, va, data).is_ok())
    }

    /// Last observed trap; never reported for a domain that has been reclaimed.
    pub fn last_trap(&self) -> Option<(Option<DomainId>, TrapFrame)> {
        let st = self.state.lock();
        st.last_trap.get().filter(|(owner, _)| owner.map_or(true, |id| st.envs.get(id).is_some()))
    }

    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    pub fn cpu_status(&self, cpu: CpuId) -> CpuStatus {
        self.cpus[cpu.as_index()].status()
    }

    /// Privileged-entry stack descriptor of `cpu`.
    pub fn task_state(&self, cpu: CpuId) -> TaskState {
        self.cpus[cpu.as_index()].task_state()
    }

    /// Drains the status transition log (see `KernelConfig::record_transitions`).
    pub fn take_transitions(&self) -> Vec<Transition> {
        self.state.lock().envs.take_transitions()
    }
}
