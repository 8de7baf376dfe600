//! Per-VM device I/O owner.

use std::sync::Arc;

use crate::arch::{Barrier, HostBarrier};
use crate::builder::VmIoBuilder;
use crate::device::virtio::console::RX_QUEUE;
use crate::device::virtio::{
    DeviceHandle, DeviceRegistry, PollMode, QueueContext, QueueWorker, VirtioConsole,
    VirtioDevice, VirtioMmioTransport,
};
use crate::device::DeviceBackend;
use crate::diag::{self, DiagClient, DiagReceiver};
use crate::error::{Error, Result};
use crate::irq::{InterruptInjector, LineConfig, LocalIrqChip, RaiseOutcome, SourceId, TriggerMode};
use crate::memory::{layout, GuestMemory, GuestMemoryCell};

/// First interrupt vector handed to devices.
pub const DEVICE_VECTOR_BASE: u8 = 32;

/// Most devices one VM can hold.
pub const MAX_DEVICES: usize = (u8::MAX - DEVICE_VECTOR_BASE) as usize + 1;

/// The state of a [`VmIo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Devices can be added; no workers run yet.
    Created,
    /// Queue workers are serving.
    Running,
    /// Workers stopped and vCPUs released from halt.
    Shutdown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::Running => write!(f, "running"),
            VmState::Shutdown => write!(f, "shutdown"),
        }
    }
}

struct Slot<B: Barrier> {
    handle: DeviceHandle,
    backend: Arc<dyn DeviceBackend<B>>,
    transport: VirtioMmioTransport<B>,
}

/// Device I/O state of one virtual machine.
///
/// `VmIo` owns guest memory, the device registry, the interrupt injector and
/// its local interrupt chip, the virtio-mmio transports, queue workers and the
/// diagnostic channel. Instances share nothing, so several VMs can live in
/// one process.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use vmio::{VirtioConsole, VmIo};
///
/// let mut vm = VmIo::builder().vcpus(2).build()?;
/// let console = vm.add_console(Arc::new(VirtioConsole::new()))?;
/// vm.start()?;
/// # let _ = console;
/// # Ok::<(), vmio::Error>(())
/// ```
pub struct VmIo<B: Barrier = HostBarrier> {
    state: VmState,
    vcpus: u32,
    max_queue_size: u16,
    trigger: TriggerMode,
    poll_mode: PollMode,
    ctx: QueueContext<B>,
    chip: Arc<LocalIrqChip>,
    slots: Vec<Slot<B>>,
    workers: Vec<QueueWorker>,
    diag_client: DiagClient,
    diag: DiagReceiver,
}

impl<B: Barrier> std::fmt::Debug for VmIo<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmIo")
            .field("state", &self.state)
            .field("vcpus", &self.vcpus)
            .field("devices", &self.slots.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl VmIo {
    /// Create a new builder.
    pub fn builder() -> VmIoBuilder {
        VmIoBuilder::new()
    }
}

impl<B: Barrier> VmIo<B> {
    pub(crate) fn new(
        memory: GuestMemory,
        vcpus: u32,
        max_queue_size: u16,
        trigger: TriggerMode,
        poll_mode: PollMode,
    ) -> Self {
        let chip = Arc::new(LocalIrqChip::new(vcpus));
        let ctx = QueueContext {
            registry: Arc::new(DeviceRegistry::new()),
            injector: Arc::new(InterruptInjector::new(vcpus, chip.clone())),
            memory: Arc::new(GuestMemoryCell::new(memory)),
        };
        let (diag_client, diag) = diag::channel();
        Self {
            state: VmState::Created,
            vcpus,
            max_queue_size,
            trigger,
            poll_mode,
            ctx,
            chip,
            slots: Vec::new(),
            workers: Vec::new(),
            diag_client,
            diag,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpus
    }

    pub fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }

    /// Current guest memory layout.
    pub fn memory(&self) -> Arc<GuestMemory> {
        self.ctx.memory.current()
    }

    /// Install a new guest memory layout. Traversals already running keep
    /// the layout they started with.
    pub fn replace_memory(&self, memory: GuestMemory) -> Arc<GuestMemory> {
        self.ctx.memory.replace(memory)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry<B>> {
        &self.ctx.registry
    }

    pub fn injector(&self) -> &Arc<InterruptInjector> {
        &self.ctx.injector
    }

    pub fn irq_chip(&self) -> &Arc<LocalIrqChip> {
        &self.chip
    }

    /// Handles shared with queue workers.
    pub fn context(&self) -> QueueContext<B> {
        self.ctx.clone()
    }

    /// Register a device backend and map it at the next virtio-mmio slot.
    ///
    /// The device gets its own interrupt line targeting vCPU 0. If the VM is
    /// already running, workers for its queues start right away.
    pub fn add_device(&mut self, backend: Arc<dyn DeviceBackend<B>>) -> Result<DeviceHandle> {
        let index = self.slots.len();
        if index >= MAX_DEVICES {
            return Err(Error::DeviceLimit(MAX_DEVICES));
        }
        let vector = DEVICE_VECTOR_BASE + index as u8;
        let line = self
            .ctx
            .injector
            .add_line(LineConfig::vector(self.trigger, vector, 0));

        let handle = self.ctx.registry.register(VirtioDevice::new(
            backend.device_type(),
            backend.features(),
            backend.config_space(),
            backend.num_queues(),
            self.max_queue_size,
            line,
        ));
        let base_addr = layout::MMIO_BASE + index as u64 * layout::MMIO_STRIDE;
        let transport = VirtioMmioTransport::new(self.ctx.clone(), handle, self.trigger, base_addr)
            .with_backend(backend.clone());

        tracing::debug!(
            device = handle.0,
            device_type = backend.device_type(),
            base = format_args!("{base_addr:#x}"),
            vector,
            line = line.0,
            "device added"
        );
        self.slots.push(Slot {
            handle,
            backend,
            transport,
        });
        if self.state == VmState::Running {
            self.spawn_workers(index)?;
        }
        Ok(handle)
    }

    /// Add a console and wire host input to its receive queue.
    pub fn add_console(&mut self, console: Arc<VirtioConsole>) -> Result<DeviceHandle> {
        let handle = self.add_device(console.clone())?;
        let kick = self.ctx.registry.lookup(handle)?.read().kick(RX_QUEUE)?;
        console.attach_rx_kick(kick);
        Ok(handle)
    }

    /// Transport of a device.
    pub fn transport(&self, handle: DeviceHandle) -> Option<&VirtioMmioTransport<B>> {
        self.slots
            .iter()
            .find(|s| s.handle == handle)
            .map(|s| &s.transport)
    }

    /// Dispatch a guest MMIO read. Returns `None` if no device claims `addr`.
    pub fn mmio_read(&self, addr: u64) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.transport.contains(addr))
            .map(|s| s.transport.read(addr))
    }

    /// Dispatch a guest MMIO write. Returns `false` if no device claims `addr`.
    pub fn mmio_write(&mut self, addr: u64, value: u32) -> bool {
        match self.slots.iter_mut().find(|s| s.transport.contains(addr)) {
            Some(slot) => {
                slot.transport.write(addr, value);
                true
            }
            None => false,
        }
    }

    /// Start a worker for every queue of every device.
    pub fn start(&mut self) -> Result<()> {
        if self.state != VmState::Created {
            return Ok(());
        }
        for index in 0..self.slots.len() {
            self.spawn_workers(index)?;
        }
        self.state = VmState::Running;
        tracing::debug!(workers = self.workers.len(), "device I/O started");
        Ok(())
    }

    fn spawn_workers(&mut self, index: usize) -> Result<()> {
        let slot = &self.slots[index];
        for queue in 0..slot.backend.num_queues() {
            self.workers.push(QueueWorker::spawn(
                self.ctx.clone(),
                slot.handle,
                queue,
                slot.backend.clone(),
                self.poll_mode,
            )?);
        }
        Ok(())
    }

    /// Change configuration space from the host side and notify the driver
    /// with a configuration-change interrupt.
    pub fn update_config(
        &self,
        handle: DeviceHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<RaiseOutcome> {
        let line = {
            let device = self.ctx.registry.lookup(handle)?;
            let mut device = device.write();
            device.update_config(offset, data);
            device.line()
        };
        self.ctx.injector.assert_line(line, SourceId::CONFIG)
    }

    /// Client end of the diagnostic channel.
    pub fn diag_client(&self) -> DiagClient {
        self.diag_client.clone()
    }

    /// Run all queued diagnostic commands. Call this from the VM event loop.
    pub fn poll_diagnostics(&mut self) -> usize {
        self.diag
            .poll(&self.ctx.injector, Some(self.chip.as_ref()), &self.ctx.registry)
    }

    /// Stop all workers and release halted vCPUs.
    pub fn shutdown(&mut self) {
        if self.state == VmState::Shutdown {
            return;
        }
        for worker in self.workers.drain(..) {
            let (device, queue) = (worker.device(), worker.queue());
            let stats = worker.join();
            tracing::debug!(device = device.0, queue, ?stats, "queue worker stopped");
        }
        self.chip.shutdown();
        self.state = VmState::Shutdown;
    }
}

impl<B: Barrier> Drop for VmIo<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
