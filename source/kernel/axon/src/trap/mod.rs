// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout and classification of privileged entries
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, TrapKind, Exception, Interrupt, trap_name, fmt_trap, LastTrap
//! DEPENDS_ON: axon_abi::{PushRegs, layout::seg}
//! INVARIANTS: Classification is total over trap numbers; privilege is derived from cs only

pub mod diag;

use axon_abi::layout::seg::{FL_IF, GD_UD, GD_UT};
use axon_abi::PushRegs;

pub use diag::{fmt_trap, trap_name, LastTrap};

/// Trap numbers.
pub mod vector {
    pub const T_DIVIDE: u32 = 0;
    pub const T_DEBUG: u32 = 1;
    pub const T_NMI: u32 = 2;
    pub const T_BRKPT: u32 = 3;
    pub const T_OFLOW: u32 = 4;
    pub const T_BOUND: u32 = 5;
    pub const T_ILLOP: u32 = 6;
    pub const T_DEVICE: u32 = 7;
    pub const T_DBLFLT: u32 = 8;
    pub const T_COPROC: u32 = 9;
    pub const T_TSS: u32 = 10;
    pub const T_SEGNP: u32 = 11;
    pub const T_STACK: u32 = 12;
    pub const T_GPFLT: u32 = 13;
    pub const T_PGFLT: u32 = 14;
    pub const T_FPERR: u32 = 16;
    pub const T_ALIGN: u32 = 17;
    pub const T_MCHK: u32 = 18;
    pub const T_SIMDERR: u32 = 19;
    pub const T_SYSCALL: u32 = 48;

    pub const IRQ_OFFSET: u32 = 32;
    pub const IRQ_TIMER: u32 = 0;
    pub const IRQ_KBD: u32 = 1;
    pub const IRQ_SERIAL: u32 = 4;
    pub const IRQ_SPURIOUS: u32 = 7;
    pub const IRQ_ERROR: u32 = 19;
    /// Lines routed through the interrupt controller.
    pub const IRQ_LINES: u32 = 16;
}

use vector::*;

/// Register snapshot captured on every privileged entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    /// Faulting address latched by the entry stub for page faults.
    pub fault_va: u32,
}

static_assertions::const_assert!(TrapFrame::SIZE % 4 == 0);

impl TrapFrame {
    /// Serialised size used by `env_set_trapframe`.
    pub const SIZE: usize = 18 * 4;

    /// Initial frame for a user domain entering at `entry` with stack `esp`.
    pub fn user(entry: u32, esp: u32) -> Self {
        Self {
            ds: GD_UD,
            es: GD_UD,
            ss: GD_UD,
            cs: GD_UT,
            eip: entry,
            esp,
            eflags: FL_IF,
            ..Self::default()
        }
    }

    /// True if the trap was taken from user privilege.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Classifies the trap number.
    pub fn kind(&self) -> TrapKind {
        TrapKind::classify(self.trapno)
    }

    /// Syscall number and its five argument registers.
    pub fn syscall_regs(&self) -> (u32, [u32; 5]) {
        let r = &self.regs;
        (r.eax, [r.edx, r.ecx, r.ebx, r.edi, r.esi])
    }

    /// Little-endian image, registers first.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let r = &self.regs;
        let words: [u32; 18] = [
            r.edi,
            r.esi,
            r.ebp,
            r.oesp,
            r.ebx,
            r.edx,
            r.ecx,
            r.eax,
            u32::from(self.es),
            u32::from(self.ds),
            self.trapno,
            self.err,
            self.eip,
            u32::from(self.cs),
            self.eflags,
            self.esp,
            u32::from(self.ss),
            self.fault_va,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Parses the image written by [`TrapFrame::to_le_bytes`].
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut w = [0u32; 18];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self {
            regs: PushRegs {
                edi: w[0],
                esi: w[1],
                ebp: w[2],
                oesp: w[3],
                ebx: w[4],
                edx: w[5],
                ecx: w[6],
                eax: w[7],
            },
            es: w[8] as u16,
            ds: w[9] as u16,
            trapno: w[10],
            err: w[11],
            eip: w[12],
            cs: w[13] as u16,
            eflags: w[14],
            esp: w[15],
            ss: w[16] as u16,
            fault_va: w[17],
        })
    }
}

/// Processor exceptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    CoprocessorOverrun,
    InvalidTss,
    SegmentNotPresent,
    StackFault,
    GeneralProtection,
    PageFault,
    FpuError,
    AlignmentCheck,
    MachineCheck,
    SimdError,
}

/// Device interrupts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    Timer,
    Keyboard,
    Serial,
    Spurious,
    Error,
    /// Any other controller line.
    Line(u32),
}

/// Class of a privileged entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    Exception(Exception),
    Syscall,
    Interrupt(Interrupt),
    /// Reserved or unassigned vector.
    Unknown(u32),
}

impl TrapKind {
    pub fn classify(trapno: u32) -> Self {
        use Exception::*;
        let exception = match trapno {
            T_DIVIDE => DivideError,
            T_DEBUG => Debug,
            T_NMI => Nmi,
            T_BRKPT => Breakpoint,
            T_OFLOW => Overflow,
            T_BOUND => BoundRange,
            T_ILLOP => InvalidOpcode,
            T_DEVICE => DeviceNotAvailable,
            T_DBLFLT => DoubleFault,
            T_COPROC => CoprocessorOverrun,
            T_TSS => InvalidTss,
            T_SEGNP => SegmentNotPresent,
            T_STACK => StackFault,
            T_GPFLT => GeneralProtection,
            T_PGFLT => PageFault,
            T_FPERR => FpuError,
            T_ALIGN => AlignmentCheck,
            T_MCHK => MachineCheck,
            T_SIMDERR => SimdError,
            T_SYSCALL => return TrapKind::Syscall,
            n if (IRQ_OFFSET..IRQ_OFFSET + IRQ_LINES).contains(&n) || n == IRQ_OFFSET + IRQ_ERROR => {
                return TrapKind::Interrupt(match n - IRQ_OFFSET {
                    IRQ_TIMER => Interrupt::Timer,
                    IRQ_KBD => Interrupt::Keyboard,
                    IRQ_SERIAL => Interrupt::Serial,
                    IRQ_SPURIOUS => Interrupt::Spurious,
                    IRQ_ERROR => Interrupt::Error,
                    line => Interrupt::Line(line),
                });
            }
            other => return TrapKind::Unknown(other),
        };
        TrapKind::Exception(exception)
    }
}
