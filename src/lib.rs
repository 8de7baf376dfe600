//! # vmio
//!
//! Device I/O core for a lightweight userspace VMM: split virtqueues shared
//! with the guest, a virtio device registry with a virtio-mmio register
//! layer, and interrupt injection back into the guest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmio::{Result, VirtioConsole, VmIo};
//!
//! fn main() -> Result<()> {
//!     let mut vm = VmIo::builder()
//!         .vcpus(2)
//!         .build()?;
//!
//!     vm.add_console(Arc::new(VirtioConsole::new()))?;
//!     vm.start()?;
//!
//!     // From the vCPU exit handler:
//!     let _ = vm.mmio_read(vmio::layout::MMIO_BASE);
//!     Ok(())
//! }
//! ```
//!
//! ## Memory Ordering
//!
//! Ring accesses go through a [`Barrier`] implementation picked per target:
//!
//! - **x86 / x86_64**: [`StrongOrdered`]
//! - **aarch64**: [`WeakOrdered`]
//! - **riscv64**: [`FenceOrdered`]

pub mod arch;
mod builder;
pub mod debug;
pub mod device;
pub mod diag;
mod error;
pub mod irq;
pub mod memory;
mod vm;

#[cfg(test)]
mod testing;

// Re-exports
pub use arch::{Barrier, FenceOrdered, HostBarrier, StrongOrdered, WeakOrdered};
pub use builder::VmIoBuilder;
pub use device::virtio::{
    DeviceHandle, DeviceRegistry, PollMode, VirtQueue, VirtioConsole, VirtioMmioTransport,
};
pub use device::DeviceBackend;
pub use diag::{DiagClient, DiagCommand, DiagReply};
pub use error::{ChainFault, Error, Result};
pub use irq::{InterruptInjector, InterruptSink, LineId, LocalIrqChip, SourceId, TriggerMode};
pub use memory::{layout, GuestMemory, GuestMemoryCell};
pub use vm::{VmIo, VmState};
