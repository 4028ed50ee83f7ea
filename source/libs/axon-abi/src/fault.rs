// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault record delivered to a domain's page-fault upcall.
//!
//! The kernel writes a [`UTrapframe`] onto the user exception stack as 13
//! little-endian words; the user trampoline reads it back with
//! [`UTrapframe::from_le_bytes`].

bitflags::bitflags! {
    /// Hardware page-fault error code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Protection violation (clear: page not present).
        const PROTECTION = 0x1;
        /// Caused by a write (clear: read).
        const WRITE = 0x2;
        /// Raised at user privilege.
        const USER = 0x4;
    }
}

/// General-purpose registers in `pusha` order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored on restore.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    fn words(&self) -> [u32; 8] {
        [self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax]
    }

    fn from_words(w: &[u32]) -> Self {
        Self { edi: w[0], esi: w[1], ebp: w[2], oesp: w[3], ebx: w[4], edx: w[5], ecx: w[6], eax: w[7] }
    }
}

/// Record pushed on the exception stack for a user page fault.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: u32,
    /// Hardware error code.
    pub err: u32,
    /// Registers at the time of the fault.
    pub regs: PushRegs,
    /// Faulting program counter.
    pub eip: u32,
    /// Flags at the time of the fault.
    pub eflags: u32,
    /// Stack pointer at the time of the fault.
    pub esp: u32,
}

impl UTrapframe {
    /// Encoded size in bytes.
    pub const SIZE: usize = 13 * 4;

    /// Decoded error code.
    pub fn code(&self) -> FaultCode {
        FaultCode::from_bits_truncate(self.err)
    }

    /// Serialises the record as it sits in user memory.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u32; 13];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..10].copy_from_slice(&self.regs.words());
        words[10] = self.eip;
        words[11] = self.eflags;
        words[12] = self.esp;
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parses a record read from user memory.
    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u32; 13];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&words[2..10]),
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }
}
