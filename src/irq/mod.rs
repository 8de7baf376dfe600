//! Interrupt injection.
//!
//! [`InterruptInjector`] owns every interrupt line of one VM. Device queues
//! raise lines through it after publishing completions; the guest's
//! acknowledgment path (interrupt-status register, controller EOI) moves the
//! lines back to idle. Actual delivery goes through an [`InterruptSink`]
//! supplied by the vCPU run loop, e.g. [`LocalIrqChip`].

mod chip;
mod line;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub use chip::{HaltWake, LocalIrqChip, VcpuIrqSnapshot};
pub use line::{Delivery, InterruptLine, LineConfig, LineState, LineStats, TriggerMode};

use crate::arch::Barrier;
use crate::debug_irq;
use crate::device::virtio::VirtQueue;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// Identifier of an interrupt line within one injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u32);

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of up to 64 sources sharing a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u8);

impl SourceId {
    /// Number of distinct sources a line can aggregate.
    pub const LIMIT: u8 = 64;

    /// Source used for configuration-change interrupts.
    pub const CONFIG: SourceId = SourceId(Self::LIMIT - 1);

    pub fn new(id: u8) -> Result<Self> {
        if id >= Self::LIMIT {
            return Err(Error::InvalidSource(id));
        }
        Ok(Self(id))
    }

    /// Source for queue `index` of a device.
    pub fn queue(index: u16) -> Result<Self> {
        match u8::try_from(index) {
            Ok(id) if id < Self::CONFIG.0 => Ok(Self(id)),
            _ => Err(Error::InvalidSource(u8::try_from(index).unwrap_or(u8::MAX))),
        }
    }

    pub fn id(self) -> u8 {
        self.0
    }

    pub(crate) fn bit(self) -> u64 {
        1 << self.0
    }
}

/// Delivery primitives provided by the vCPU run loop.
pub trait InterruptSink: Send + Sync {
    /// Make `vector` pending on `vcpu`.
    fn inject(&self, vcpu: u32, vector: u8);

    /// Latch a non-maskable interrupt on `vcpu`.
    fn inject_nmi(&self, vcpu: u32);

    /// `vcpu` is runnable; wake it if it is halted.
    fn wake(&self, vcpu: u32);
}

/// What a raise did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// The line became pending and the interrupt was delivered.
    Raised,
    /// The line was already pending; the raise merged into it.
    Coalesced,
    /// The guest asked for no interrupt.
    Suppressed,
}

/// Snapshot of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSnapshot {
    pub id: LineId,
    pub config: LineConfig,
    pub state: LineState,
    pub pending_sources: u64,
    pub stats: LineStats,
}

/// Owner of all interrupt lines of a VM.
pub struct InterruptInjector {
    lines: RwLock<Vec<Mutex<InterruptLine>>>,
    nmi_lines: Vec<LineId>,
    sink: Arc<dyn InterruptSink>,
}

impl std::fmt::Debug for InterruptInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptInjector")
            .field("lines", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl InterruptInjector {
    /// Create an injector for `vcpus` vCPUs. Each vCPU gets a dedicated NMI
    /// line.
    pub fn new(vcpus: u32, sink: Arc<dyn InterruptSink>) -> Self {
        let lines: Vec<_> = (0..vcpus)
            .map(|vcpu| Mutex::new(InterruptLine::new(LineConfig::nmi(vcpu))))
            .collect();
        Self {
            nmi_lines: (0..vcpus).map(LineId).collect(),
            lines: RwLock::new(lines),
            sink,
        }
    }

    /// Add a line and return its id.
    pub fn add_line(&self, config: LineConfig) -> LineId {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        let id = LineId(lines.len() as u32);
        lines.push(Mutex::new(InterruptLine::new(config)));
        tracing::debug!(line = id.0, ?config, "interrupt line added");
        id
    }

    /// Number of vCPUs (and NMI lines).
    pub fn vcpu_count(&self) -> u32 {
        self.nmi_lines.len() as u32
    }

    /// NMI line of `vcpu`.
    pub fn nmi_line(&self, vcpu: u32) -> Option<LineId> {
        self.nmi_lines.get(vcpu as usize).copied()
    }

    fn with_line<R>(&self, id: LineId, f: impl FnOnce(&mut InterruptLine) -> R) -> Result<R> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let line = lines.get(id.0 as usize).ok_or(Error::UnknownLine(id))?;
        let mut line: MutexGuard<'_, InterruptLine> =
            line.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut line))
    }

    fn deliver(&self, config: LineConfig) {
        match config.delivery {
            Delivery::Vector(vector) => self.sink.inject(config.target_vcpu, vector),
            Delivery::Nmi => self.sink.inject_nmi(config.target_vcpu),
        }
        self.sink.wake(config.target_vcpu);
    }

    /// Raise `line` on behalf of `queue` after completions were published.
    ///
    /// Suppression is decided per queue; the resulting raise coalesces with
    /// anything already pending on the line.
    pub fn raise<B: Barrier>(
        &self,
        line: LineId,
        source: SourceId,
        queue: &mut VirtQueue<B>,
        mem: &GuestMemory,
    ) -> Result<RaiseOutcome> {
        if !queue.notify_needed(mem)? {
            self.with_line(line, InterruptLine::note_suppressed)?;
            debug_irq!(line = line.0, queue = queue.index(), "raise suppressed");
            return Ok(RaiseOutcome::Suppressed);
        }
        self.assert_line(line, source)
    }

    /// Raise `line` unconditionally (configuration changes, tests).
    pub fn assert_line(&self, line: LineId, source: SourceId) -> Result<RaiseOutcome> {
        let (deliver, config) = self.with_line(line, |l| (l.assert(source), l.config()))?;
        if deliver {
            // Delivered after the line lock is released; the sink may block.
            self.deliver(config);
            debug_irq!(line = line.0, source = source.id(), "line pending");
            Ok(RaiseOutcome::Raised)
        } else {
            debug_irq!(line = line.0, source = source.id(), "raise coalesced");
            Ok(RaiseOutcome::Coalesced)
        }
    }

    /// Guest acknowledgment. Returns the sources that were pending.
    ///
    /// Acknowledging a line with nothing pending fails with `NotPending`; the
    /// spurious acknowledgment is counted on the line.
    pub fn acknowledge(&self, line: LineId) -> Result<u64> {
        match self.with_line(line, InterruptLine::acknowledge)? {
            Some(sources) => {
                debug_irq!(line = line.0, sources, "line acknowledged");
                Ok(sources)
            }
            None => {
                tracing::debug!(line = line.0, "spurious interrupt acknowledgment");
                Err(Error::NotPending(line))
            }
        }
    }

    /// End of interrupt on a level line. Returns `true` if the line re-armed
    /// because a source raised it while it was acknowledged.
    pub fn end_of_interrupt(&self, line: LineId) -> Result<bool> {
        let (rearmed, config) = self.with_line(line, |l| (l.end_of_interrupt(), l.config()))?;
        match rearmed {
            Some(true) => {
                self.deliver(config);
                debug_irq!(line = line.0, "line re-armed at EOI");
                Ok(true)
            }
            Some(false) => {
                debug_irq!(line = line.0, "line idle");
                Ok(false)
            }
            None => Err(Error::InvalidEoi(line)),
        }
    }

    /// Deliver an NMI to `vcpu`, bypassing suppression and coalescing.
    pub fn force_nmi(&self, vcpu: u32) -> Result<()> {
        let line = self
            .nmi_line(vcpu)
            .ok_or_else(|| Error::InvalidDiagCommand(format!("no vCPU {vcpu}")))?;
        let config = self.with_line(line, |l| {
            l.note_pulse();
            l.config()
        })?;
        self.deliver(config);
        tracing::info!(vcpu, "NMI delivered");
        Ok(())
    }

    /// Current state of `line`.
    pub fn line_state(&self, line: LineId) -> Result<LineState> {
        self.with_line(line, |l| l.state())
    }

    /// Counters of `line`.
    pub fn line_stats(&self, line: LineId) -> Result<LineStats> {
        self.with_line(line, |l| l.stats())
    }

    /// Drop pending state of `line`.
    pub fn reset_line(&self, line: LineId) -> Result<()> {
        self.with_line(line, InterruptLine::reset)
    }

    /// Snapshot of every line.
    pub fn snapshot(&self) -> Vec<LineSnapshot> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let line = line.lock().unwrap_or_else(PoisonError::into_inner);
                LineSnapshot {
                    id: LineId(i as u32),
                    config: line.config(),
                    state: line.state(),
                    pending_sources: line.pending_sources(),
                    stats: line.stats(),
                }
            })
            .collect()
    }
}
