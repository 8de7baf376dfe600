//! Virtual device emulation.
//!
//! This module provides the virtio device core and the contract device
//! backends implement.

pub mod virtio;

// Re-export commonly used virtio types
pub use virtio::{DeviceHandle, DeviceRegistry, VirtQueue, VirtioConsole, VirtioMmioTransport};

use crate::arch::{Barrier, HostBarrier};
use crate::error::Result;
use crate::memory::GuestMemory;

/// Host side of a virtio device.
///
/// The registry owns the device state; a backend only moves data. Backends
/// are shared between worker threads, so mutable state sits behind interior
/// mutability.
pub trait DeviceBackend<B: Barrier = HostBarrier>: Send + Sync {
    /// Get the device type ID.
    fn device_type(&self) -> u32;

    /// Device-specific feature bits offered to the driver.
    fn features(&self) -> u64;

    /// Number of queues the device exposes.
    fn num_queues(&self) -> u16;

    /// Initial configuration space image.
    fn config_space(&self) -> Vec<u8>;

    /// Drain newly available chains of queue `queue_index` and publish their
    /// completions. Returns the number of completions published.
    ///
    /// Guest faults inside a chain are completed as errors (zero bytes)
    /// rather than returned.
    fn process_queue(
        &self,
        queue_index: u16,
        queue: &mut VirtQueue<B>,
        mem: &GuestMemory,
    ) -> Result<usize>;

    /// The driver wrote configuration space.
    fn config_write(&self, _offset: u64, _data: &[u8]) {}

    /// The device was reset.
    fn reset(&self) {}
}

/// Device type IDs (virtio spec).
pub mod device_type {
    pub const CONSOLE: u32 = 3;
}
