//! Diagnostic control path.
//!
//! Operators send fixed-size command records to a running VM: dump the
//! interrupt and queue state, or force a non-maskable interrupt on one or
//! all vCPUs. Commands travel over a channel into the VM owner, which runs
//! them in order from its event loop ([`crate::VmIo::poll_diagnostics`]) and
//! answers each on its own reply channel.
//!
//! Wire format, 16 bytes little-endian:
//!
//! ```text
//! type: u32 (1)  length: u32 (16)  sub_type: u32  target_cpu: u32
//! ```

use tokio::sync::{mpsc, oneshot};

use crate::arch::Barrier;
use crate::device::virtio::{DeviceHandle, DeviceRegistry, QueueStats};
use crate::error::{Error, Result};
use crate::irq::{InterruptInjector, LineSnapshot, LocalIrqChip, VcpuIrqSnapshot};

/// Record type of debug commands.
pub const DIAG_TYPE_DEBUG: u32 = 1;
/// Size of a command record.
pub const DIAG_RECORD_SIZE: usize = 16;
/// `target_cpu` value addressing every vCPU.
pub const DIAG_ALL_CPUS: u32 = 0xFFFF_FFFF;

mod sub_type {
    pub const DUMP_STATE: u32 = 0;
    pub const RAISE_NMI: u32 = 1;
}

/// What to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagAction {
    DumpState,
    RaiseNmi,
}

/// Which vCPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagTarget {
    All,
    Vcpu(u32),
}

/// A decoded command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagCommand {
    pub action: DiagAction,
    pub target: DiagTarget,
}

impl DiagCommand {
    pub fn dump(target: DiagTarget) -> Self {
        Self {
            action: DiagAction::DumpState,
            target,
        }
    }

    pub fn nmi(target: DiagTarget) -> Self {
        Self {
            action: DiagAction::RaiseNmi,
            target,
        }
    }

    /// Decode a command record.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let raw: &[u8; DIAG_RECORD_SIZE] = raw.try_into().map_err(|_| {
            Error::InvalidDiagCommand(format!("record is {} bytes, expected 16", raw.len()))
        })?;
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let (kind, length, sub, cpu) = (word(0), word(4), word(8), word(12));

        if kind != DIAG_TYPE_DEBUG {
            return Err(Error::InvalidDiagCommand(format!("unknown type {kind}")));
        }
        if length as usize != DIAG_RECORD_SIZE {
            return Err(Error::InvalidDiagCommand(format!("bad length {length}")));
        }
        let action = match sub {
            sub_type::DUMP_STATE => DiagAction::DumpState,
            sub_type::RAISE_NMI => DiagAction::RaiseNmi,
            other => {
                return Err(Error::InvalidDiagCommand(format!("unknown sub-type {other}")))
            }
        };
        let target = match cpu {
            DIAG_ALL_CPUS => DiagTarget::All,
            vcpu => DiagTarget::Vcpu(vcpu),
        };
        Ok(Self { action, target })
    }

    /// Encode into a command record.
    pub fn encode(&self) -> [u8; DIAG_RECORD_SIZE] {
        let sub = match self.action {
            DiagAction::DumpState => sub_type::DUMP_STATE,
            DiagAction::RaiseNmi => sub_type::RAISE_NMI,
        };
        let cpu = match self.target {
            DiagTarget::All => DIAG_ALL_CPUS,
            DiagTarget::Vcpu(vcpu) => vcpu,
        };
        let mut raw = [0u8; DIAG_RECORD_SIZE];
        for (i, word) in [DIAG_TYPE_DEBUG, DIAG_RECORD_SIZE as u32, sub, cpu]
            .into_iter()
            .enumerate()
        {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }
}

/// State of one queue in a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub index: u16,
    pub size: u16,
    pub ready: bool,
    pub last_avail_idx: u16,
    pub next_used_idx: u16,
    pub outstanding: usize,
    pub stats: QueueStats,
}

/// State of one device in a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub handle: DeviceHandle,
    pub device_type: u32,
    pub status: u8,
    pub acked_features: u64,
    pub interrupt_status: u32,
    pub queues: Vec<QueueSnapshot>,
}

/// Reply to a dump request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDump {
    pub lines: Vec<LineSnapshot>,
    pub vcpus: Vec<VcpuIrqSnapshot>,
    pub devices: Vec<DeviceSnapshot>,
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagReply {
    /// NMIs were delivered to these vCPUs.
    NmiDelivered(Vec<u32>),
    State(StateDump),
}

type ReplyTx = oneshot::Sender<Result<DiagReply>>;

/// Sending half, handed to operators.
#[derive(Debug, Clone)]
pub struct DiagClient {
    tx: mpsc::UnboundedSender<(DiagCommand, ReplyTx)>,
}

/// Receiving half, owned by the VM.
#[derive(Debug)]
pub struct DiagReceiver {
    rx: mpsc::UnboundedReceiver<(DiagCommand, ReplyTx)>,
}

/// Create a connected client/receiver pair.
pub fn channel() -> (DiagClient, DiagReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DiagClient { tx }, DiagReceiver { rx })
}

/// A reply that has not arrived yet.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<DiagReply>>,
}

impl PendingReply {
    /// Wait for the reply.
    pub async fn wait(self) -> Result<DiagReply> {
        self.rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Wait for the reply from synchronous code. Must not be called from an
    /// async context.
    pub fn wait_blocking(self) -> Result<DiagReply> {
        self.rx.blocking_recv().map_err(|_| Error::ChannelClosed)?
    }
}

impl DiagClient {
    /// Queue a command; the reply arrives once the VM polls its channel.
    pub fn submit(&self, command: DiagCommand) -> Result<PendingReply> {
        let (reply_tx, rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .map_err(|_| Error::ChannelClosed)?;
        Ok(PendingReply { rx })
    }

    /// Decode a raw record and queue it.
    pub fn submit_raw(&self, raw: &[u8]) -> Result<PendingReply> {
        self.submit(DiagCommand::decode(raw)?)
    }

    /// Send a command and wait for its reply.
    pub async fn request(&self, command: DiagCommand) -> Result<DiagReply> {
        self.submit(command)?.wait().await
    }
}

impl DiagReceiver {
    /// Run every queued command. Returns how many ran.
    pub fn poll<B: Barrier>(
        &mut self,
        injector: &InterruptInjector,
        chip: Option<&LocalIrqChip>,
        registry: &DeviceRegistry<B>,
    ) -> usize {
        let mut handled = 0;
        while let Ok((command, reply)) = self.rx.try_recv() {
            let result = execute(&command, injector, chip, registry);
            if let Err(err) = &result {
                tracing::warn!(?command, "diagnostic command failed: {err}");
            }
            // The requester may have given up waiting.
            let _ = reply.send(result);
            handled += 1;
        }
        handled
    }
}

fn target_vcpus(target: DiagTarget, vcpus: u32) -> Result<Vec<u32>> {
    match target {
        DiagTarget::All => Ok((0..vcpus).collect()),
        DiagTarget::Vcpu(vcpu) if vcpu < vcpus => Ok(vec![vcpu]),
        DiagTarget::Vcpu(vcpu) => Err(Error::InvalidDiagCommand(format!(
            "vCPU {vcpu} out of range ({vcpus} vCPUs)"
        ))),
    }
}

/// Run one command against a VM's interrupt and device state.
pub fn execute<B: Barrier>(
    command: &DiagCommand,
    injector: &InterruptInjector,
    chip: Option<&LocalIrqChip>,
    registry: &DeviceRegistry<B>,
) -> Result<DiagReply> {
    let vcpus = target_vcpus(command.target, injector.vcpu_count())?;
    match command.action {
        DiagAction::RaiseNmi => {
            for &vcpu in &vcpus {
                injector.force_nmi(vcpu)?;
            }
            Ok(DiagReply::NmiDelivered(vcpus))
        }
        DiagAction::DumpState => {
            let dump = StateDump {
                lines: injector.snapshot(),
                vcpus: chip
                    .map(|chip| {
                        chip.snapshot()
                            .into_iter()
                            .filter(|s| vcpus.contains(&s.vcpu))
                            .collect()
                    })
                    .unwrap_or_default(),
                devices: snapshot_devices(registry),
            };
            log_dump(&dump);
            Ok(DiagReply::State(dump))
        }
    }
}

fn snapshot_devices<B: Barrier>(registry: &DeviceRegistry<B>) -> Vec<DeviceSnapshot> {
    registry
        .handles()
        .into_iter()
        .filter_map(|handle| registry.lookup(handle).ok())
        .map(|device| {
            let device = device.read();
            let queues = (0..device.num_queues())
                .filter_map(|i| device.queue(i).ok())
                .map(|q| QueueSnapshot {
                    index: q.index(),
                    size: q.size(),
                    ready: q.is_ready(),
                    last_avail_idx: q.last_avail_idx(),
                    next_used_idx: q.next_used_idx(),
                    outstanding: q.outstanding(),
                    stats: q.stats(),
                })
                .collect();
            DeviceSnapshot {
                handle: device.handle(),
                device_type: device.device_type(),
                status: device.status(),
                acked_features: device.acked_features(),
                interrupt_status: device.interrupt_status(),
                queues,
            }
        })
        .collect()
}

fn log_dump(dump: &StateDump) {
    for line in &dump.lines {
        tracing::info!(
            line = line.id.0,
            state = ?line.state,
            sources = format_args!("{:#x}", line.pending_sources),
            delivered = line.stats.delivered,
            suppressed = line.stats.suppressed,
            "interrupt line"
        );
    }
    for vcpu in &dump.vcpus {
        tracing::info!(
            vcpu = vcpu.vcpu,
            pending = ?vcpu.pending,
            nmi = vcpu.nmi,
            halted = vcpu.halted,
            "vCPU interrupt state"
        );
    }
    for device in &dump.devices {
        for queue in &device.queues {
            tracing::info!(
                device = device.handle.0,
                queue = queue.index,
                ready = queue.ready,
                last_avail = queue.last_avail_idx,
                next_used = queue.next_used_idx,
                outstanding = queue.outstanding,
                malformed = queue.stats.malformed,
                "queue state"
            );
        }
    }
}
