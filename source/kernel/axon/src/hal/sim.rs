// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory collaborators for host tests and the machine simulator
//! OWNERS: @kernel-team
//! PUBLIC API: SimPlatform, SimFrames, BufferConsole, RecordingMonitor, LoopbackNic, CountingIrq, SimCpu
//! DEPENDS_ON: hal traits, mm::PageRef
//! INVARIANTS: Frame accounting matches live PageRefs; no real hardware access

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use super::{Console, CpuControl, FrameAllocator, InterruptController, Monitor, Nic, NicError, Platform};
use crate::config::MAX_CPUS;
use crate::log;
use crate::mm::{FrameSink, PageRef};
use crate::trap::TrapFrame;
use crate::types::CpuId;

struct FramePool {
    limit: Option<usize>,
    live: AtomicUsize,
    next: AtomicU32,
    released: AtomicUsize,
}

impl FrameSink for FramePool {
    fn release(&self, _number: u32) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Heap-backed frame allocator with an optional frame limit.
pub struct SimFrames {
    pool: Arc<FramePool>,
}

impl SimFrames {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            pool: Arc::new(FramePool {
                limit,
                live: AtomicUsize::new(0),
                next: AtomicU32::new(1),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Frames currently referenced by anyone.
    pub fn live(&self) -> usize {
        self.pool.live.load(Ordering::Acquire)
    }

    /// Frames returned so far.
    pub fn released(&self) -> usize {
        self.pool.released.load(Ordering::Relaxed)
    }
}

impl FrameAllocator for SimFrames {
    fn alloc_zeroed(&self) -> Option<PageRef> {
        let live = self.pool.live.fetch_add(1, Ordering::AcqRel);
        if self.pool.limit.is_some_and(|limit| live >= limit) {
            self.pool.live.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        let number = self.pool.next.fetch_add(1, Ordering::Relaxed);
        let sink: Arc<dyn FrameSink> = self.pool.clone();
        Some(PageRef::zeroed(number, Some(sink)))
    }
}

/// Console that buffers output and serves queued input.
#[derive(Default)]
pub struct BufferConsole {
    out: Mutex<String>,
    input: Mutex<VecDeque<u8>>,
    keyboard: AtomicUsize,
    serial: AtomicUsize,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything printed so far.
    pub fn text(&self) -> String {
        self.out.lock().clone()
    }

    /// Queues input returned by `getc`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// (keyboard, serial) interrupt counts.
    pub fn interrupt_counts(&self) -> (usize, usize) {
        (self.keyboard.load(Ordering::Relaxed), self.serial.load(Ordering::Relaxed))
    }
}

impl Console for BufferConsole {
    fn print(&self, text: &str) {
        self.out.lock().push_str(text);
    }

    fn getc(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }

    fn keyboard_intr(&self) {
        self.keyboard.fetch_add(1, Ordering::Relaxed);
    }

    fn serial_intr(&self) {
        self.serial.fetch_add(1, Ordering::Relaxed);
    }
}

impl log::Sink for BufferConsole {
    fn write_str(&self, s: &str) {
        self.print(s);
    }
}

/// Monitor that records every entry.
#[derive(Default)]
pub struct RecordingMonitor {
    entries: Mutex<Vec<Option<TrapFrame>>>,
}

impl RecordingMonitor {
    pub fn entries(&self) -> Vec<Option<TrapFrame>> {
        self.entries.lock().clone()
    }
}

impl Monitor for RecordingMonitor {
    fn enter(&self, frame: Option<&TrapFrame>) {
        self.entries.lock().push(frame.copied());
    }
}

/// NIC that keeps transmitted frames and serves injected ones.
pub struct LoopbackNic {
    capacity: usize,
    tx: Mutex<Vec<Vec<u8>>>,
    rx: Mutex<VecDeque<Vec<u8>>>,
}

impl LoopbackNic {
    /// `capacity` frames may be queued before transmit reports busy.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, tx: Mutex::new(Vec::new()), rx: Mutex::new(VecDeque::new()) }
    }

    /// Takes all transmitted frames, freeing the ring.
    pub fn drain_tx(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.tx.lock())
    }

    /// Makes `packet` available to `receive`.
    pub fn inject_rx(&self, packet: &[u8]) {
        self.rx.lock().push_back(packet.to_vec());
    }
}

impl Nic for LoopbackNic {
    fn transmit(&self, packet: &[u8]) -> Result<(), NicError> {
        let mut tx = self.tx.lock();
        if tx.len() >= self.capacity {
            return Err(NicError::Busy);
        }
        tx.push(packet.to_vec());
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize, NicError> {
        let packet = self.rx.lock().pop_front().ok_or(NicError::Empty)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }
}

/// Interrupt controller that counts acknowledgements per CPU.
#[derive(Default)]
pub struct CountingIrq {
    eois: [AtomicU32; MAX_CPUS],
}

impl CountingIrq {
    pub fn eois(&self, cpu: CpuId) -> u32 {
        self.eois[cpu.as_index()].load(Ordering::Relaxed)
    }
}

impl InterruptController for CountingIrq {
    fn eoi(&self, cpu: CpuId) {
        self.eois[cpu.as_index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Interrupt flag per simulated CPU; clear by default as on trap entry.
#[derive(Default)]
pub struct SimCpu {
    interrupts: [AtomicBool; MAX_CPUS],
}

impl SimCpu {
    pub fn set_interrupts_enabled(&self, cpu: CpuId, on: bool) {
        self.interrupts[cpu.as_index()].store(on, Ordering::Relaxed);
    }
}

impl CpuControl for SimCpu {
    fn interrupts_enabled(&self, cpu: CpuId) -> bool {
        self.interrupts[cpu.as_index()].load(Ordering::Relaxed)
    }
}

/// Complete in-memory platform.
pub struct SimPlatform {
    pub frames: SimFrames,
    pub console: BufferConsole,
    pub monitor: RecordingMonitor,
    pub nic: Option<LoopbackNic>,
    pub irq: CountingIrq,
    pub cpu: SimCpu,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            frames: SimFrames::new(None),
            console: BufferConsole::new(),
            monitor: RecordingMonitor::default(),
            nic: None,
            irq: CountingIrq::default(),
            cpu: SimCpu::default(),
        }
    }

    /// Caps physical memory at `frames` pages.
    pub fn with_frame_limit(mut self, frames: usize) -> Self {
        self.frames = SimFrames::new(Some(frames));
        self
    }

    /// Attaches a loopback NIC with a transmit ring of `capacity` frames.
    pub fn with_nic(mut self, capacity: usize) -> Self {
        self.nic = Some(LoopbackNic::new(capacity));
        self
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn frames(&self) -> &dyn FrameAllocator {
        &self.frames
    }

    fn console(&self) -> &dyn Console {
        &self.console
    }

    fn monitor(&self) -> &dyn Monitor {
        &self.monitor
    }

    fn nic(&self) -> Option<&dyn Nic> {
        self.nic.as_ref().map(|n| n as &dyn Nic)
    }

    fn irq(&self) -> &dyn InterruptController {
        &self.irq
    }

    fn cpu(&self) -> &dyn CpuControl {
        &self.cpu
    }
}
