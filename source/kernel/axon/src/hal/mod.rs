// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware and collaborator abstraction layer.
//!
//! The core consumes physical memory, the console, the monitor, the NIC and
//! the interrupt controller only through these traits.

pub mod sim;

use core::fmt;

use crate::mm::PageRef;
use crate::trap::TrapFrame;
use crate::types::CpuId;

/// Physical page allocator.
pub trait FrameAllocator: Send + Sync {
    /// Returns a zero-filled frame or `None` when memory is exhausted.
    fn alloc_zeroed(&self) -> Option<PageRef>;
}

/// Diagnostic console. Printing never fails the caller.
pub trait Console: Send + Sync {
    /// Prints already formatted text.
    fn print(&self, text: &str);

    /// Next buffered input character, if any.
    fn getc(&self) -> Option<u8> {
        None
    }

    /// Keyboard interrupt hook.
    fn keyboard_intr(&self) {}

    /// Serial interrupt hook.
    fn serial_intr(&self) {}
}

/// Interactive debugging monitor entered on breakpoints.
pub trait Monitor: Send + Sync {
    /// Runs the monitor; returning resumes the interrupted context.
    fn enter(&self, frame: Option<&TrapFrame>);
}

/// NIC failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicError {
    /// Transmit ring full.
    Busy,
    /// Nothing received.
    Empty,
}

/// Network interface used by the packet system calls.
pub trait Nic: Send + Sync {
    /// Queues one frame for transmission.
    fn transmit(&self, packet: &[u8]) -> Result<(), NicError>;
    /// Copies one received frame into `buf`, returning its length.
    fn receive(&self, buf: &mut [u8]) -> Result<usize, NicError>;
}

/// Local interrupt controller.
pub trait InterruptController: Send + Sync {
    /// Acknowledges the interrupt being serviced on `cpu`.
    fn eoi(&self, cpu: CpuId);
}

/// Processor state queries.
pub trait CpuControl: Send + Sync {
    /// Current interrupt-enable flag of `cpu`.
    fn interrupts_enabled(&self, cpu: CpuId) -> bool;
}

/// Bundle of collaborators the kernel is built over.
pub trait Platform: Send + Sync {
    fn frames(&self) -> &dyn FrameAllocator;
    fn console(&self) -> &dyn Console;
    fn monitor(&self) -> &dyn Monitor;
    fn nic(&self) -> Option<&dyn Nic>;
    fn irq(&self) -> &dyn InterruptController;
    fn cpu(&self) -> &dyn CpuControl;
}

/// `fmt::Write` adapter over a [`Console`].
pub struct ConsoleWriter<'a>(pub &'a dyn Console);

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.print(s);
        Ok(())
    }
}
