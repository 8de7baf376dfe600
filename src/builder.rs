//! Builder for configuring and creating a [`VmIo`].

use crate::arch::HostBarrier;
use crate::device::virtio::queue::{DEFAULT_QUEUE_SIZE, MAX_QUEUE_SIZE};
use crate::device::virtio::PollMode;
use crate::error::{Error, Result};
use crate::irq::TriggerMode;
use crate::memory::{layout, GuestMemory, GuestMemoryRegion};
use crate::vm::VmIo;

/// Builder for creating a [`VmIo`].
///
/// # Example
///
/// ```rust,no_run
/// use vmio::{layout, VmIo};
///
/// let vm = VmIo::builder()
///     .vcpus(2)
///     .ram(layout::RAM_BASE, 64 << 20)
///     .max_queue_size(1024)
///     .build()?;
/// # Ok::<(), vmio::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct VmIoBuilder {
    vcpus: Option<u32>,
    ram: Vec<(u64, u64)>,
    readonly: Vec<(u64, Vec<u8>)>,
    holes: Vec<(u64, u64)>,
    max_queue_size: Option<u32>,
    trigger: Option<TriggerMode>,
    poll_mode: Option<PollMode>,
}

impl VmIoBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of virtual CPUs.
    ///
    /// Default: 1
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = Some(count);
        self
    }

    /// Add a RAM region. Without any, one region of
    /// [`layout::DEFAULT_RAM_SIZE`] is placed at [`layout::RAM_BASE`].
    pub fn ram(mut self, guest_addr: u64, size: u64) -> Self {
        self.ram.push((guest_addr, size));
        self
    }

    /// Add a read-only region holding `contents`.
    pub fn readonly(mut self, guest_addr: u64, contents: impl Into<Vec<u8>>) -> Self {
        self.readonly.push((guest_addr, contents.into()));
        self
    }

    /// Declare an address range that exists but has no backing.
    pub fn hole(mut self, guest_addr: u64, size: u64) -> Self {
        self.holes.push((guest_addr, size));
        self
    }

    /// Set the largest queue size devices accept.
    ///
    /// Default: 256
    pub fn max_queue_size(mut self, size: u32) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Set the trigger mode of device interrupt lines.
    ///
    /// Default: level on aarch64, edge elsewhere
    pub fn trigger_mode(mut self, trigger: TriggerMode) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Set how queue workers wait for work.
    pub fn poll_mode(mut self, mode: PollMode) -> Self {
        self.poll_mode = Some(mode);
        self
    }

    /// Build the VM.
    ///
    /// This validates the configuration and maps guest memory.
    pub fn build(self) -> Result<VmIo<HostBarrier>> {
        let vcpus = self.vcpus.unwrap_or(1);
        if vcpus == 0 {
            return Err(Error::InvalidVcpuCount(vcpus));
        }

        let limit = self.max_queue_size.unwrap_or(u32::from(DEFAULT_QUEUE_SIZE));
        let max_queue_size = match u16::try_from(limit) {
            Ok(size) if (2..=MAX_QUEUE_SIZE).contains(&size) && size.is_power_of_two() => size,
            _ => return Err(Error::InvalidQueueLimit(limit)),
        };

        let mut memory = GuestMemory::new();
        if self.ram.is_empty() {
            memory.add_region(GuestMemoryRegion::new(
                layout::RAM_BASE,
                layout::DEFAULT_RAM_SIZE,
            ))?;
        }
        for (addr, size) in self.ram {
            memory.add_region(GuestMemoryRegion::new(addr, size))?;
        }
        for (addr, contents) in &self.readonly {
            memory.add_readonly(*addr, contents)?;
        }
        for (addr, size) in self.holes {
            memory.add_region(GuestMemoryRegion::hole(addr, size))?;
        }

        let trigger = self.trigger.unwrap_or_else(TriggerMode::host_default);
        let poll_mode = self.poll_mode.unwrap_or_default();
        tracing::debug!(
            vcpus,
            max_queue_size,
            ?trigger,
            ?poll_mode,
            backed = memory.backed_size(),
            "building VM device I/O"
        );

        Ok(VmIo::new(memory, vcpus, max_queue_size, trigger, poll_mode))
    }
}
