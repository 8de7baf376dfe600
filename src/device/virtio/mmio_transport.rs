//! VirtIO MMIO transport layer.
//!
//! This implements the virtio-mmio register interface (virtio 1.x, section
//! 4.2) on top of the device registry: every register access is routed to
//! the [`VirtioDevice`](super::VirtioDevice) owned by the registry, so there
//! is no second copy of device state in the transport.

use std::sync::Arc;
use std::time::Duration;

use super::registry::DeviceHandle;
use super::worker::QueueContext;
use super::{interrupt, mmio, status, VIRTIO_MAGIC, VIRTIO_VENDOR, VIRTIO_VERSION};
use crate::arch::{Barrier, HostBarrier};
use crate::debug_transport;
use crate::device::DeviceBackend;
use crate::error::{Error, Result};
use crate::irq::TriggerMode;

/// Size of the MMIO region for a virtio device.
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;

/// How long a guest-initiated reset waits for running queue passes.
const RESET_TIMEOUT: Duration = Duration::from_secs(1);

/// Ring whose address a register pair holds.
#[derive(Clone, Copy)]
enum Ring {
    Desc,
    Driver,
    Device,
}

/// Which half of a 64-bit ring address a register holds.
#[derive(Clone, Copy)]
enum Half {
    Low,
    High,
}

fn set_half(old: u64, half: Half, value: u32) -> u64 {
    match half {
        Half::Low => (old & 0xFFFF_FFFF_0000_0000) | u64::from(value),
        Half::High => (old & 0x0000_0000_FFFF_FFFF) | (u64::from(value) << 32),
    }
}

/// VirtIO MMIO transport state.
pub struct VirtioMmioTransport<B: Barrier = HostBarrier> {
    ctx: QueueContext<B>,
    handle: DeviceHandle,
    /// Backend notified of config writes and resets.
    backend: Option<Arc<dyn DeviceBackend<B>>>,
    /// Selected feature page (0 or 1).
    device_features_sel: u32,
    /// Selected feature page for driver (0 or 1).
    driver_features_sel: u32,
    /// Driver features (low 32 bits).
    driver_features_lo: u32,
    /// Driver features (high 32 bits).
    driver_features_hi: u32,
    /// Selected queue index.
    queue_sel: u32,
    /// Base address of this device.
    base_addr: u64,
    /// Trigger mode of the device line.
    trigger: TriggerMode,
}

impl<B: Barrier> std::fmt::Debug for VirtioMmioTransport<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioMmioTransport")
            .field("handle", &self.handle)
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("queue_sel", &self.queue_sel)
            .finish_non_exhaustive()
    }
}

impl<B: Barrier> VirtioMmioTransport<B> {
    /// Create a new MMIO transport for a registered device.
    pub fn new(
        ctx: QueueContext<B>,
        handle: DeviceHandle,
        trigger: TriggerMode,
        base_addr: u64,
    ) -> Self {
        Self {
            ctx,
            handle,
            backend: None,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features_lo: 0,
            driver_features_hi: 0,
            queue_sel: 0,
            base_addr,
            trigger,
        }
    }

    /// Forward config writes and resets to `backend`.
    pub fn with_backend(mut self, backend: Arc<dyn DeviceBackend<B>>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Get the base address.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Device this transport exposes.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Check if an address falls within this device's MMIO region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_addr && addr < self.base_addr + VIRTIO_MMIO_SIZE
    }

    /// Get the currently selected queue index.
    pub fn queue_sel(&self) -> u32 {
        self.queue_sel
    }

    fn selected_queue(&self) -> Option<u16> {
        u16::try_from(self.queue_sel).ok()
    }

    /// Read from an MMIO register.
    pub fn read(&self, addr: u64) -> u32 {
        let offset = addr.wrapping_sub(self.base_addr);
        let Ok(device) = self.ctx.registry.lookup(self.handle) else {
            return 0;
        };
        let device = device.read();

        let value = match offset {
            mmio::MAGIC_VALUE => VIRTIO_MAGIC,
            mmio::VERSION => VIRTIO_VERSION,
            mmio::DEVICE_ID => device.device_type(),
            mmio::VENDOR_ID => VIRTIO_VENDOR,
            mmio::DEVICE_FEATURES => {
                let features = device.offered_features();
                match self.device_features_sel {
                    0 => features as u32,
                    1 => (features >> 32) as u32,
                    _ => 0,
                }
            }
            mmio::QUEUE_NUM_MAX => self
                .selected_queue()
                .and_then(|q| device.queue(q).ok())
                .map(|q| u32::from(q.max_size()))
                .unwrap_or(0),
            mmio::QUEUE_READY => self
                .selected_queue()
                .and_then(|q| device.queue(q).ok())
                .map(|q| u32::from(q.is_ready()))
                .unwrap_or(0),
            mmio::INTERRUPT_STATUS => device.interrupt_status(),
            mmio::STATUS => u32::from(device.status()),
            mmio::CONFIG_GENERATION => device.config_generation(),
            offset if offset >= mmio::CONFIG => {
                let mut data = [0u8; 4];
                device.read_config(offset - mmio::CONFIG, &mut data);
                u32::from_le_bytes(data)
            }
            _ => 0,
        };
        debug_transport!(device = self.handle.0, offset, value, "mmio read");
        value
    }

    /// Write to an MMIO register.
    pub fn write(&mut self, addr: u64, value: u32) {
        let offset = addr.wrapping_sub(self.base_addr);
        debug_transport!(device = self.handle.0, offset, value, "mmio write");
        if let Err(err) = self.write_register(offset, value) {
            tracing::warn!(
                device = self.handle.0,
                offset = format_args!("{:#x}", offset),
                value = format_args!("{:#x}", value),
                "mmio write failed: {err}"
            );
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) -> Result<()> {
        match offset {
            mmio::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            mmio::DRIVER_FEATURES => {
                if self.driver_features_sel == 0 {
                    self.driver_features_lo = value;
                } else {
                    self.driver_features_hi = value;
                }
            }
            mmio::DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            mmio::QUEUE_SEL => self.queue_sel = value,
            mmio::QUEUE_NUM => {
                self.with_queue(|q| q.negotiate(value).map(drop))?;
            }
            mmio::QUEUE_READY => self.set_queue_ready(value != 0)?,
            mmio::QUEUE_NOTIFY => {
                let queue = u16::try_from(value).map_err(|_| Error::UnknownQueue {
                    device: self.handle,
                    queue: u16::MAX,
                })?;
                let kick = self.ctx.registry.lookup(self.handle)?.read().kick(queue)?;
                kick.kick();
            }
            mmio::INTERRUPT_ACK => self.ack_interrupt(value)?,
            mmio::STATUS => self.set_status((value & 0xFF) as u8)?,
            mmio::QUEUE_DESC_LOW => self.set_ring_addr(Ring::Desc, Half::Low, value)?,
            mmio::QUEUE_DESC_HIGH => self.set_ring_addr(Ring::Desc, Half::High, value)?,
            mmio::QUEUE_DRIVER_LOW => self.set_ring_addr(Ring::Driver, Half::Low, value)?,
            mmio::QUEUE_DRIVER_HIGH => self.set_ring_addr(Ring::Driver, Half::High, value)?,
            mmio::QUEUE_DEVICE_LOW => self.set_ring_addr(Ring::Device, Half::Low, value)?,
            mmio::QUEUE_DEVICE_HIGH => self.set_ring_addr(Ring::Device, Half::High, value)?,
            offset if offset >= mmio::CONFIG => {
                let config_offset = offset - mmio::CONFIG;
                let data = value.to_le_bytes();
                self.ctx
                    .registry
                    .lookup(self.handle)?
                    .write()
                    .write_config(config_offset, &data);
                if let Some(backend) = &self.backend {
                    backend.config_write(config_offset, &data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn with_queue<R>(
        &self,
        f: impl FnOnce(&mut super::VirtQueue<B>) -> Result<R>,
    ) -> Result<R> {
        let index = self.selected_queue().ok_or(Error::UnknownQueue {
            device: self.handle,
            queue: u16::MAX,
        })?;
        let device = self.ctx.registry.lookup(self.handle)?;
        let device = device.read();
        let mut queue = device.queue(index)?;
        f(&mut queue)
    }

    fn set_ring_addr(&self, ring: Ring, half: Half, value: u32) -> Result<()> {
        self.with_queue(|q| {
            match ring {
                Ring::Desc => q.set_desc_table(set_half(q.desc_table(), half, value)),
                Ring::Driver => q.set_avail_ring(set_half(q.avail_ring(), half, value)),
                Ring::Device => q.set_used_ring(set_half(q.used_ring(), half, value)),
            }
            Ok(())
        })
    }

    fn set_queue_ready(&self, ready: bool) -> Result<()> {
        let mem = self.ctx.memory.current();
        let result = self.with_queue(|q| {
            if ready {
                q.activate(&mem)
            } else {
                q.deactivate();
                Ok(())
            }
        });
        if let Err(err) = &result {
            if err.is_guest_fault() {
                let device = self.ctx.registry.lookup(self.handle)?;
                let mut device = device.write();
                let needs_reset = device.status() | status::DEVICE_NEEDS_RESET;
                device.set_status(needs_reset);
            }
        }
        result
    }

    fn ack_interrupt(&self, bits: u32) -> Result<()> {
        let device = self.ctx.registry.lookup(self.handle)?;
        let (remaining, line) = {
            let device = device.read();
            (device.clear_interrupt_status(bits), device.line())
        };
        if remaining != 0 {
            return Ok(());
        }
        match self.ctx.injector.acknowledge(line) {
            // The line may be shared and already acknowledged by another
            // device on it.
            Ok(_) | Err(Error::NotPending(_)) => {}
            Err(err) => return Err(err),
        }
        if self.trigger == TriggerMode::Level {
            match self.ctx.injector.end_of_interrupt(line) {
                Ok(_) | Err(Error::InvalidEoi(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn set_status(&mut self, new_status: u8) -> Result<()> {
        let device = self.ctx.registry.lookup(self.handle)?;
        let old_status = device.read().status();
        tracing::debug!(
            device = self.handle.0,
            old = format_args!("{:#04x}", old_status),
            new = format_args!("{:#04x}", new_status),
            "status change"
        );

        if new_status == 0 {
            return self.reset_device();
        }

        let mut new_status = new_status;
        // Check if FEATURES_OK is being set (transition check)
        if new_status & status::FEATURES_OK != 0 && old_status & status::FEATURES_OK == 0 {
            let requested =
                (u64::from(self.driver_features_hi) << 32) | u64::from(self.driver_features_lo);
            let agreed = self.ctx.registry.negotiate_features(self.handle, requested)?;
            if agreed != requested {
                tracing::warn!(
                    device = self.handle.0,
                    requested = format_args!("{:#x}", requested),
                    agreed = format_args!("{:#x}", agreed),
                    "driver asked for features the device does not offer"
                );
                new_status &= !status::FEATURES_OK;
            }
        }
        if new_status & status::DRIVER_OK != 0 && old_status & status::DRIVER_OK == 0 {
            tracing::debug!(device = self.handle.0, "driver ready");
        }

        device.write().set_status(new_status);
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        let registry = &self.ctx.registry;
        registry.request_drain(self.handle)?;
        let result = registry
            .wait_idle(self.handle, RESET_TIMEOUT)
            .and_then(|()| registry.deactivate(self.handle));
        registry.resume(self.handle)?;

        match result {
            Ok(()) => {
                if let Some(backend) = &self.backend {
                    backend.reset();
                }
                self.device_features_sel = 0;
                self.driver_features_sel = 0;
                self.driver_features_lo = 0;
                self.driver_features_hi = 0;
                self.queue_sel = 0;
                Ok(())
            }
            Err(err) => {
                let device = registry.lookup(self.handle)?;
                device.write().set_status(status::DEVICE_NEEDS_RESET);
                Err(err)
            }
        }
    }

    /// Check if the device has unacknowledged interrupt status bits.
    pub fn has_pending_interrupt(&self) -> bool {
        self.ctx
            .registry
            .lookup(self.handle)
            .map(|d| {
                d.read().interrupt_status() & (interrupt::USED_BUFFER | interrupt::CONFIG_CHANGE)
                    != 0
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virtio::console::{VirtioConsole, TX_QUEUE};
    use crate::device::virtio::feature;
    use crate::device::virtio::registry::{DeviceRegistry, VirtioDevice};
    use crate::irq::{InterruptInjector, LineConfig, LineState, SourceId};
    use crate::memory::{layout, GuestMemory, GuestMemoryCell};
    use crate::testing::{GuestDriver, RecordingSink, SharedOutput, DATA_BASE, DRIVER_RAM_SIZE};

    const BASE: u64 = layout::MMIO_BASE;

    struct Fixture {
        transport: VirtioMmioTransport,
        ctx: QueueContext,
        console: Arc<VirtioConsole>,
        output: SharedOutput,
        driver: GuestDriver,
    }

    fn fixture(trigger: TriggerMode) -> Fixture {
        let memory = Arc::new(GuestMemoryCell::new(
            GuestMemory::with_ram(layout::RAM_BASE, DRIVER_RAM_SIZE).unwrap(),
        ));
        let injector = Arc::new(InterruptInjector::new(1, RecordingSink::new()));
        let line = injector.add_line(LineConfig::vector(trigger, 34, 0));
        let registry: Arc<DeviceRegistry> = Arc::new(DeviceRegistry::new());
        let output = SharedOutput::default();
        let console = Arc::new(VirtioConsole::with_output(Box::new(output.clone())));
        let backend: &dyn DeviceBackend = console.as_ref();
        let handle = registry.register(VirtioDevice::new(
            backend.device_type(),
            backend.features(),
            backend.config_space(),
            backend.num_queues(),
            64,
            line,
        ));
        let ctx = QueueContext {
            registry,
            injector,
            memory: memory.clone(),
        };
        let transport =
            VirtioMmioTransport::new(ctx.clone(), handle, trigger, BASE).with_backend(console.clone());
        let driver = GuestDriver::with_memory(memory.current(), layout::RAM_BASE, 16);
        Fixture {
            transport,
            ctx,
            console,
            output,
            driver,
        }
    }

    fn write_addr(t: &mut VirtioMmioTransport, low: u64, addr: u64) {
        t.write(BASE + low, addr as u32);
        t.write(BASE + low + 4, (addr >> 32) as u32);
    }

    /// Driver initialization as Linux performs it.
    fn bring_up(f: &mut Fixture, features: u64) {
        let t = &mut f.transport;
        t.write(BASE + mmio::STATUS, u32::from(status::ACKNOWLEDGE | status::DRIVER));
        t.write(BASE + mmio::DRIVER_FEATURES_SEL, 0);
        t.write(BASE + mmio::DRIVER_FEATURES, features as u32);
        t.write(BASE + mmio::DRIVER_FEATURES_SEL, 1);
        t.write(BASE + mmio::DRIVER_FEATURES, (features >> 32) as u32);
        t.write(
            BASE + mmio::STATUS,
            u32::from(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK),
        );

        t.write(BASE + mmio::QUEUE_SEL, u32::from(TX_QUEUE));
        t.write(BASE + mmio::QUEUE_NUM, 16);
        write_addr(t, mmio::QUEUE_DESC_LOW, f.driver.desc_table());
        write_addr(t, mmio::QUEUE_DRIVER_LOW, f.driver.avail_ring());
        write_addr(t, mmio::QUEUE_DEVICE_LOW, f.driver.used_ring());
        t.write(BASE + mmio::QUEUE_READY, 1);
        t.write(
            BASE + mmio::STATUS,
            u32::from(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK),
        );
    }

    #[test]
    fn test_identity_registers() {
        let f = fixture(TriggerMode::Edge);
        let t = &f.transport;
        assert!(t.contains(BASE + 0x1FF));
        assert!(!t.contains(BASE + VIRTIO_MMIO_SIZE));
        assert_eq!(t.read(BASE + mmio::MAGIC_VALUE), VIRTIO_MAGIC);
        assert_eq!(t.read(BASE + mmio::VERSION), 2);
        assert_eq!(t.read(BASE + mmio::DEVICE_ID), 3);
        assert_eq!(t.read(BASE + mmio::VENDOR_ID), VIRTIO_VENDOR);
        assert_eq!(t.read(BASE + mmio::QUEUE_NUM_MAX), 64);
        // cols = 80, rows = 25
        assert_eq!(t.read(BASE + mmio::CONFIG), 80 | (25 << 16));
    }

    #[test]
    fn test_bring_up_and_transmit() {
        let mut f = fixture(TriggerMode::Edge);
        let requested = feature::VIRTIO_F_VERSION_1 | feature::VIRTIO_RING_F_EVENT_IDX;
        bring_up(&mut f, requested);

        let t = &mut f.transport;
        assert_eq!(t.read(BASE + mmio::STATUS) & u32::from(status::FEATURES_OK), 8);
        t.write(BASE + mmio::QUEUE_SEL, u32::from(TX_QUEUE));
        assert_eq!(t.read(BASE + mmio::QUEUE_READY), 1);

        let device = f.ctx.registry.lookup(t.handle()).unwrap();
        assert_eq!(device.read().acked_features(), requested);
        let kick = device.read().kick(TX_QUEUE).unwrap();

        f.driver.memory().write(DATA_BASE, b"hi").unwrap();
        f.driver.write_desc(0, DATA_BASE, 2, 0, 0);
        f.driver.publish(0);
        // used_event 0: interrupt after the first completion.
        f.driver.set_used_event(0);
        t.write(BASE + mmio::QUEUE_NOTIFY, u32::from(TX_QUEUE));
        assert!(kick.take());

        f.ctx
            .service_queue(t.handle(), TX_QUEUE, f.console.as_ref())
            .unwrap();
        assert_eq!(f.output.contents(), b"hi");
        assert!(t.has_pending_interrupt());
        assert_eq!(t.read(BASE + mmio::INTERRUPT_STATUS), interrupt::USED_BUFFER);

        let line = device.read().line();
        assert_eq!(f.ctx.injector.line_state(line).unwrap(), LineState::Pending);
        t.write(BASE + mmio::INTERRUPT_ACK, interrupt::USED_BUFFER);
        assert_eq!(t.read(BASE + mmio::INTERRUPT_STATUS), 0);
        assert_eq!(f.ctx.injector.line_state(line).unwrap(), LineState::Idle);
    }

    #[test]
    fn test_unoffered_features_refused() {
        let mut f = fixture(TriggerMode::Edge);
        bring_up(&mut f, feature::VIRTIO_F_VERSION_1 | (1 << 40));
        let status_reg = f.transport.read(BASE + mmio::STATUS);
        assert_eq!(status_reg & u32::from(status::FEATURES_OK), 0);
        let device = f.ctx.registry.lookup(f.transport.handle()).unwrap();
        assert_eq!(device.read().acked_features(), feature::VIRTIO_F_VERSION_1);
    }

    #[test]
    fn test_level_line_ack_sends_eoi() {
        let mut f = fixture(TriggerMode::Level);
        bring_up(&mut f, feature::VIRTIO_F_VERSION_1);
        let device = f.ctx.registry.lookup(f.transport.handle()).unwrap();
        let line = device.read().line();

        device.read().set_interrupt_status(interrupt::USED_BUFFER);
        f.ctx.injector.assert_line(line, SourceId::queue(1).unwrap()).unwrap();
        f.transport.write(BASE + mmio::INTERRUPT_ACK, interrupt::USED_BUFFER);
        assert_eq!(f.ctx.injector.line_state(line).unwrap(), LineState::Idle);
    }

    #[test]
    fn test_status_zero_resets() {
        let mut f = fixture(TriggerMode::Edge);
        bring_up(&mut f, feature::VIRTIO_F_VERSION_1);
        f.transport.write(BASE + mmio::STATUS, 0);

        assert_eq!(f.transport.read(BASE + mmio::STATUS), 0);
        f.transport.write(BASE + mmio::QUEUE_SEL, u32::from(TX_QUEUE));
        assert_eq!(f.transport.read(BASE + mmio::QUEUE_READY), 0);
        let device = f.ctx.registry.lookup(f.transport.handle()).unwrap();
        assert_eq!(device.read().acked_features(), 0);
        assert!(!device.is_draining());
    }

    #[test]
    fn test_reset_while_busy_needs_reset() {
        let mut f = fixture(TriggerMode::Edge);
        bring_up(&mut f, feature::VIRTIO_F_VERSION_1);
        let guard = f.ctx.registry.begin_traversal(f.transport.handle()).unwrap();
        f.transport.write(BASE + mmio::STATUS, 0);
        assert_eq!(
            f.transport.read(BASE + mmio::STATUS),
            u32::from(status::DEVICE_NEEDS_RESET)
        );
        drop(guard);
    }

    #[test]
    fn test_bad_ring_address_needs_reset() {
        let mut f = fixture(TriggerMode::Edge);
        let t = &mut f.transport;
        t.write(BASE + mmio::QUEUE_SEL, 0);
        t.write(BASE + mmio::QUEUE_NUM, 8);
        write_addr(t, mmio::QUEUE_DESC_LOW, 0x10);
        t.write(BASE + mmio::QUEUE_READY, 1);
        assert_eq!(t.read(BASE + mmio::QUEUE_READY), 0);
        assert_ne!(t.read(BASE + mmio::STATUS) & u32::from(status::DEVICE_NEEDS_RESET), 0);
    }

    #[test]
    fn test_emergency_write_register() {
        let mut f = fixture(TriggerMode::Edge);
        f.transport.write(BASE + mmio::CONFIG + 8, u32::from(b'#'));
        assert_eq!(f.output.contents(), b"#");
    }
}
