//! Per-line interrupt state machine.
//!
//! Edge lines go `Idle -> Pending -> Idle`; level lines go
//! `Idle -> Pending -> Acknowledged -> Idle` and need an explicit
//! end-of-interrupt. Raises while a line is pending collapse into the one
//! outstanding interrupt; a raise while a level line waits for its EOI is
//! remembered and re-arms the line when the EOI arrives.

use super::SourceId;

/// How the guest's interrupt controller samples the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

impl TriggerMode {
    /// The mode the host architecture's interrupt controller expects by
    /// default (GIC SPIs are level-triggered; legacy PIC/IOAPIC routing of
    /// virtio-mmio lines is edge-triggered).
    pub fn host_default() -> Self {
        if cfg!(target_arch = "aarch64") {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }
}

/// Where the line is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A maskable interrupt vector.
    Vector(u8),
    /// The non-maskable interrupt input.
    Nmi,
}

/// Static configuration of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub trigger: TriggerMode,
    pub delivery: Delivery,
    pub target_vcpu: u32,
}

impl LineConfig {
    /// A maskable line delivering `vector` to `target_vcpu`.
    pub fn vector(trigger: TriggerMode, vector: u8, target_vcpu: u32) -> Self {
        Self {
            trigger,
            delivery: Delivery::Vector(vector),
            target_vcpu,
        }
    }

    /// The NMI line of `target_vcpu`.
    pub fn nmi(target_vcpu: u32) -> Self {
        Self {
            trigger: TriggerMode::Edge,
            delivery: Delivery::Nmi,
            target_vcpu,
        }
    }
}

/// Observable state of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Idle,
    Pending,
    Acknowledged,
}

/// Line counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    /// Deliveries to the guest, re-arms included.
    pub delivered: u64,
    /// Raises merged into an interrupt that was already outstanding.
    pub coalesced: u64,
    /// Raises dropped because the guest asked for no interrupt.
    pub suppressed: u64,
    /// Acknowledgments with nothing pending.
    pub spurious_acks: u64,
    /// EOIs that immediately re-entered `Pending`.
    pub rearmed: u64,
}

/// One interrupt line.
#[derive(Debug)]
pub struct InterruptLine {
    config: LineConfig,
    state: LineState,
    sources: u64,
    rearm: bool,
    stats: LineStats,
}

impl InterruptLine {
    pub fn new(config: LineConfig) -> Self {
        Self {
            config,
            state: LineState::Idle,
            sources: 0,
            rearm: false,
            stats: LineStats::default(),
        }
    }

    pub fn config(&self) -> LineConfig {
        self.config
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    /// Sources that raised the line since it was last acknowledged.
    pub fn pending_sources(&self) -> u64 {
        self.sources
    }

    pub fn stats(&self) -> LineStats {
        self.stats
    }

    /// Record a raise from `source`. Returns `true` when the line went from
    /// `Idle` to `Pending` and the interrupt has to be delivered.
    pub fn assert(&mut self, source: SourceId) -> bool {
        self.sources |= source.bit();
        match self.state {
            LineState::Idle => {
                self.state = LineState::Pending;
                self.stats.delivered += 1;
                true
            }
            LineState::Pending => {
                self.stats.coalesced += 1;
                false
            }
            LineState::Acknowledged => {
                self.rearm = true;
                self.stats.coalesced += 1;
                false
            }
        }
    }

    /// Count a raise withheld at the guest's request.
    pub fn note_suppressed(&mut self) {
        self.stats.suppressed += 1;
    }

    /// Count a delivery that bypasses the state machine (forced NMI).
    pub fn note_pulse(&mut self) {
        self.stats.delivered += 1;
    }

    /// Guest acknowledgment. Returns the sources that were pending, or `None`
    /// (counted as spurious) if nothing was.
    pub fn acknowledge(&mut self) -> Option<u64> {
        if self.state != LineState::Pending {
            self.stats.spurious_acks += 1;
            return None;
        }
        self.state = match self.config.trigger {
            TriggerMode::Edge => LineState::Idle,
            TriggerMode::Level => LineState::Acknowledged,
        };
        Some(std::mem::take(&mut self.sources))
    }

    /// End of interrupt on a level line. Returns `Some(true)` when a raise
    /// arrived in the meantime and the line is pending again, `None` if the
    /// line was not waiting for an EOI.
    pub fn end_of_interrupt(&mut self) -> Option<bool> {
        if self.config.trigger != TriggerMode::Level || self.state != LineState::Acknowledged {
            return None;
        }
        if std::mem::take(&mut self.rearm) {
            self.state = LineState::Pending;
            self.stats.delivered += 1;
            self.stats.rearmed += 1;
            Some(true)
        } else {
            self.state = LineState::Idle;
            Some(false)
        }
    }

    /// Drop all pending state.
    pub fn reset(&mut self) {
        self.state = LineState::Idle;
        self.sources = 0;
        self.rearm = false;
    }
}
