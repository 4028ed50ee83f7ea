// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trap diagnostics: names, frame dumps and the last observed trap.

use core::fmt::{self, Write};

use axon_abi::{DomainId, FaultCode};

use super::vector::{IRQ_LINES, IRQ_OFFSET, T_PGFLT, T_SYSCALL};
use super::TrapFrame;
use crate::types::CpuId;

const EXCEPTION_NAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

/// Human-readable name of a trap number.
pub fn trap_name(trapno: u32) -> &'static str {
    if let Some(name) = EXCEPTION_NAMES.get(trapno as usize) {
        return name;
    }
    if trapno == T_SYSCALL {
        return "System call";
    }
    if (IRQ_OFFSET..IRQ_OFFSET + IRQ_LINES).contains(&trapno) {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

/// Writes a multi-line dump of `frame`.
///
/// The faulting address is only shown when `latest` is set, i.e. the frame is
/// the one currently being handled.
pub fn fmt_trap<W: Write>(frame: &TrapFrame, cpu: CpuId, latest: bool, f: &mut W) -> fmt::Result {
    let r = &frame.regs;
    writeln!(f, "TRAP frame from CPU {}", cpu)?;
    writeln!(f, "  edi  0x{:08x}", r.edi)?;
    writeln!(f, "  esi  0x{:08x}", r.esi)?;
    writeln!(f, "  ebp  0x{:08x}", r.ebp)?;
    writeln!(f, "  oesp 0x{:08x}", r.oesp)?;
    writeln!(f, "  ebx  0x{:08x}", r.ebx)?;
    writeln!(f, "  edx  0x{:08x}", r.edx)?;
    writeln!(f, "  ecx  0x{:08x}", r.ecx)?;
    writeln!(f, "  eax  0x{:08x}", r.eax)?;
    writeln!(f, "  es   0x----{:04x}", frame.es)?;
    writeln!(f, "  ds   0x----{:04x}", frame.ds)?;
    writeln!(f, "  trap 0x{:08x} {}", frame.trapno, trap_name(frame.trapno))?;
    if latest && frame.trapno == T_PGFLT {
        writeln!(f, "  cr2  0x{:08x}", frame.fault_va)?;
    }
    write!(f, "  err  0x{:08x}", frame.err)?;
    if frame.trapno == T_PGFLT {
        let code = FaultCode::from_bits_truncate(frame.err);
        writeln!(
            f,
            " [{}, {}, {}]",
            if code.contains(FaultCode::USER) { "user" } else { "kernel" },
            if code.contains(FaultCode::WRITE) { "write" } else { "read" },
            if code.contains(FaultCode::PROTECTION) { "protection" } else { "not-present" },
        )?;
    } else {
        writeln!(f)?;
    }
    writeln!(f, "  eip  0x{:08x}", frame.eip)?;
    writeln!(f, "  cs   0x----{:04x}", frame.cs)?;
    writeln!(f, "  flag 0x{:08x}", frame.eflags)?;
    if frame.from_user() {
        writeln!(f, "  esp  0x{:08x}", frame.esp)?;
        writeln!(f, "  ss   0x----{:04x}", frame.ss)?;
    }
    Ok(())
}

/// Most recent trap frame and the domain it belongs to.
///
/// Advisory only: it is forgotten when the owner is reclaimed so a stale
/// frame is never reported for a dead domain.
#[derive(Default)]
pub struct LastTrap {
    entry: Option<(Option<DomainId>, TrapFrame)>,
}

impl LastTrap {
    pub const fn new() -> Self {
        Self { entry: None }
    }

    pub fn record(&mut self, owner: Option<DomainId>, frame: &TrapFrame) {
        self.entry = Some((owner, *frame));
    }

    /// Drops the record if it belongs to `owner`.
    pub fn forget(&mut self, owner: DomainId) {
        if matches!(self.entry, Some((Some(id), _)) if id == owner) {
            self.entry = None;
        }
    }

    pub fn get(&self) -> Option<(Option<DomainId>, TrapFrame)> {
        self.entry
    }

    /// True if `frame` is the recorded one.
    pub fn is_latest(&self, frame: &TrapFrame) -> bool {
        matches!(&self.entry, Some((_, last)) if last == frame)
    }
}
