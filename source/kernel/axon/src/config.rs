// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel configuration
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, ConfigError, MAX_CPUS, MAX_DOMAINS
//! DEPENDS_ON: axon_abi::layout
//! INVARIANTS: Validated once before the kernel is built; immutable afterwards
//!
//! The user ceiling is an explicit setting rather than something derived from
//! page-table geometry: fork, the loader and every address check use it.

use core::fmt;

use axon_abi::layout::{PFTEMP, PGSIZE, PTSIZE, UTOP};
use axon_abi::DomainId;

/// Upper bound on simulated or physical CPUs.
pub const MAX_CPUS: usize = 8;

/// Upper bound on domain table slots (limited by the id encoding).
pub const MAX_DOMAINS: usize = 1 << DomainId::LOG2_SLOTS;

/// Kernel configuration knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs that may enter the kernel.
    pub cpus: usize,
    /// Size of the fixed domain table.
    pub domain_slots: usize,
    /// First address not available to user mappings; top of the exception stack.
    pub user_top: u32,
    /// Refuse a send that offers a page to a receiver that asked for none.
    pub strict_page_offer: bool,
    /// Milliseconds represented by one timer tick.
    pub ms_per_tick: u32,
    /// Record every domain status transition (diagnostics and tests).
    pub record_transitions: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            domain_slots: MAX_DOMAINS,
            user_top: UTOP,
            strict_page_offer: false,
            ms_per_tick: 10,
            record_transitions: false,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_domain_slots(mut self, slots: usize) -> Self {
        self.domain_slots = slots;
        self
    }

    pub fn with_user_top(mut self, top: u32) -> Self {
        self.user_top = top;
        self
    }

    pub fn with_strict_page_offer(mut self, strict: bool) -> Self {
        self.strict_page_offer = strict;
        self
    }

    pub fn with_ms_per_tick(mut self, ms: u32) -> Self {
        self.ms_per_tick = ms;
        self
    }

    pub fn with_transition_log(mut self, on: bool) -> Self {
        self.record_transitions = on;
        self
    }

    /// Top of the one-page exception stack.
    pub const fn exception_stack_top(&self) -> u32 {
        self.user_top
    }

    /// Top of the normal stack handed to freshly loaded domains.
    pub const fn stack_top(&self) -> u32 {
        self.user_top - 2 * PGSIZE
    }

    /// Checks every knob against the machine limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::Cpus(self.cpus));
        }
        if self.domain_slots == 0 || self.domain_slots > MAX_DOMAINS {
            return Err(ConfigError::DomainSlots(self.domain_slots));
        }
        if self.user_top % PTSIZE != 0 || self.user_top > UTOP || self.user_top <= PFTEMP + PGSIZE {
            return Err(ConfigError::UserTop(self.user_top));
        }
        if self.ms_per_tick == 0 {
            return Err(ConfigError::TickLength);
        }
        Ok(())
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    Cpus(usize),
    DomainSlots(usize),
    UserTop(u32),
    TickLength,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpus(n) => write!(f, "cpu count {} outside 1..={}", n, MAX_CPUS),
            Self::DomainSlots(n) => write!(f, "domain slots {} outside 1..={}", n, MAX_DOMAINS),
            Self::UserTop(top) => write!(f, "user ceiling {:#010x} must be table aligned and at most UTOP", top),
            Self::TickLength => f.write_str("tick length must be non-zero"),
        }
    }
}
