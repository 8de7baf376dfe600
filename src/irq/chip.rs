//! Local interrupt chip.
//!
//! A minimal per-vCPU interrupt controller that implements the delivery
//! primitives the injector needs: a 256-vector pending bitmap, an NMI latch
//! and a halt/wake condition. Embedders with a real interrupt controller
//! provide their own [`InterruptSink`] instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::InterruptSink;
use crate::debug_irq;

/// Why [`LocalIrqChip::halt`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltWake {
    /// A maskable interrupt is pending.
    Interrupt,
    /// The NMI latch is set.
    Nmi,
    /// The chip was shut down.
    Shutdown,
    /// The timeout elapsed with nothing to do.
    TimedOut,
}

#[derive(Debug, Default)]
struct VcpuIrqState {
    /// Pending interrupt bitmap (256 vectors)
    pending: [u32; 8],
    /// NMI latch
    nmi: bool,
    /// vCPU is parked in `halt`
    halted: bool,
}

impl VcpuIrqState {
    fn set_pending(&mut self, vector: u8) {
        let idx = usize::from(vector / 32);
        let bit = vector % 32;
        self.pending[idx] |= 1 << bit;
    }

    fn clear_pending(&mut self, vector: u8) {
        let idx = usize::from(vector / 32);
        let bit = vector % 32;
        self.pending[idx] &= !(1 << bit);
    }

    fn is_pending(&self, vector: u8) -> bool {
        let idx = usize::from(vector / 32);
        let bit = vector % 32;
        (self.pending[idx] & (1 << bit)) != 0
    }

    /// Lowest pending vector.
    fn first_pending(&self) -> Option<u8> {
        self.pending.iter().enumerate().find_map(|(idx, &word)| {
            (word != 0).then(|| (idx as u32 * 32 + word.trailing_zeros()) as u8)
        })
    }

    fn pending_vectors(&self) -> Vec<u8> {
        (0..=u8::MAX).filter(|&v| self.is_pending(v)).collect()
    }
}

#[derive(Debug, Default)]
struct VcpuSlot {
    state: Mutex<VcpuIrqState>,
    wake: Condvar,
}

impl VcpuSlot {
    fn lock(&self) -> MutexGuard<'_, VcpuIrqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of one vCPU's interrupt state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuIrqSnapshot {
    pub vcpu: u32,
    pub pending: Vec<u8>,
    pub nmi: bool,
    pub halted: bool,
}

/// Per-vCPU interrupt controller.
#[derive(Debug)]
pub struct LocalIrqChip {
    vcpus: Vec<VcpuSlot>,
    shutdown: AtomicBool,
}

impl LocalIrqChip {
    /// Create a chip for `vcpus` vCPUs.
    pub fn new(vcpus: u32) -> Self {
        Self {
            vcpus: (0..vcpus).map(|_| VcpuSlot::default()).collect(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpus.len() as u32
    }

    fn slot(&self, vcpu: u32) -> Option<&VcpuSlot> {
        self.vcpus.get(vcpu as usize)
    }

    /// Set a vector pending.
    pub fn set_pending(&self, vcpu: u32, vector: u8) {
        match self.slot(vcpu) {
            Some(slot) => slot.lock().set_pending(vector),
            None => tracing::warn!(vcpu, vector, "interrupt for unknown vCPU dropped"),
        }
    }

    /// Clear a pending vector.
    pub fn clear_pending(&self, vcpu: u32, vector: u8) {
        if let Some(slot) = self.slot(vcpu) {
            slot.lock().clear_pending(vector);
        }
    }

    /// Check if a vector is pending.
    pub fn is_pending(&self, vcpu: u32, vector: u8) -> bool {
        self.slot(vcpu)
            .map(|slot| slot.lock().is_pending(vector))
            .unwrap_or(false)
    }

    /// Highest priority (lowest numbered) pending vector, left pending.
    pub fn highest_pending(&self, vcpu: u32) -> Option<u8> {
        self.slot(vcpu)?.lock().first_pending()
    }

    /// Take the highest priority pending vector, the way a guest reads an
    /// interrupt-acknowledge register.
    pub fn take_pending(&self, vcpu: u32) -> Option<u8> {
        let mut state = self.slot(vcpu)?.lock();
        let vector = state.first_pending()?;
        state.clear_pending(vector);
        debug_irq!(vcpu, vector, "vector taken");
        Some(vector)
    }

    /// Take and clear the NMI latch.
    pub fn take_nmi(&self, vcpu: u32) -> bool {
        self.slot(vcpu)
            .map(|slot| std::mem::take(&mut slot.lock().nmi))
            .unwrap_or(false)
    }

    /// Park the calling vCPU thread until an interrupt or NMI is pending, the
    /// chip is shut down, or `timeout` elapses.
    pub fn halt(&self, vcpu: u32, timeout: Option<Duration>) -> HaltWake {
        let Some(slot) = self.slot(vcpu) else {
            return HaltWake::Shutdown;
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = slot.lock();

        let wake = loop {
            if self.is_shutdown() {
                break HaltWake::Shutdown;
            }
            if state.nmi {
                break HaltWake::Nmi;
            }
            if state.first_pending().is_some() {
                break HaltWake::Interrupt;
            }

            state.halted = true;
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break HaltWake::TimedOut;
                    }
                    state = slot
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = slot.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        };

        state.halted = false;
        debug_irq!(vcpu, ?wake, "vCPU resumed");
        wake
    }

    /// Wake every halted vCPU for good.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for slot in &self.vcpus {
            let _state = slot.lock();
            slot.wake.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Snapshot of every vCPU.
    pub fn snapshot(&self) -> Vec<VcpuIrqSnapshot> {
        self.vcpus
            .iter()
            .enumerate()
            .map(|(vcpu, slot)| {
                let state = slot.lock();
                VcpuIrqSnapshot {
                    vcpu: vcpu as u32,
                    pending: state.pending_vectors(),
                    nmi: state.nmi,
                    halted: state.halted,
                }
            })
            .collect()
    }
}

impl InterruptSink for LocalIrqChip {
    fn inject(&self, vcpu: u32, vector: u8) {
        self.set_pending(vcpu, vector);
    }

    fn inject_nmi(&self, vcpu: u32) {
        match self.slot(vcpu) {
            Some(slot) => slot.lock().nmi = true,
            None => tracing::warn!(vcpu, "NMI for unknown vCPU dropped"),
        }
    }

    fn wake(&self, vcpu: u32) {
        if let Some(slot) = self.slot(vcpu) {
            let _state = slot.lock();
            slot.wake.notify_all();
        }
    }
}
