//! Test doubles: a simulated guest driver and a recording interrupt sink.

use std::sync::{Arc, Mutex, PoisonError};

use crate::arch::{Barrier, HostBarrier};
use crate::device::virtio::chain::Descriptor;
use crate::device::virtio::queue::VirtQueue;
use crate::irq::InterruptSink;
use crate::memory::{layout, GuestMemory};

/// Size of the RAM region the driver allocates.
pub const DRIVER_RAM_SIZE: u64 = 2 << 20;

/// Start of the area tests use for buffer contents.
pub const DATA_BASE: u64 = layout::RAM_BASE + 0x10_0000;

const DESC_OFFSET: u64 = 0;
const AVAIL_OFFSET: u64 = 0x8_0000;
const USED_OFFSET: u64 = 0xA_0000;

/// Plays the guest side of one split ring in host memory.
///
/// Rings sit at fixed offsets that fit the largest queue size, buffers go
/// above [`DATA_BASE`].
#[derive(Debug)]
pub struct GuestDriver {
    mem: Arc<GuestMemory>,
    base: u64,
    size: u16,
    avail_idx: u16,
    barrier: HostBarrier,
}

impl GuestDriver {
    /// Allocate guest RAM and lay out a ring of `size` entries.
    pub fn new(size: u16) -> Self {
        let mem = GuestMemory::with_ram(layout::RAM_BASE, DRIVER_RAM_SIZE).unwrap();
        Self::with_memory(Arc::new(mem), layout::RAM_BASE, size)
    }

    /// Lay out a ring at `base` inside existing memory.
    pub fn with_memory(mem: Arc<GuestMemory>, base: u64, size: u16) -> Self {
        Self {
            mem,
            base,
            size,
            avail_idx: 0,
            barrier: HostBarrier::default(),
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn memory_arc(&self) -> Arc<GuestMemory> {
        Arc::clone(&self.mem)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_table(&self) -> u64 {
        self.base + DESC_OFFSET
    }

    pub fn avail_ring(&self) -> u64 {
        self.base + AVAIL_OFFSET
    }

    pub fn used_ring(&self) -> u64 {
        self.base + USED_OFFSET
    }

    /// Negotiate the size, program the ring addresses and activate.
    pub fn configure<B: Barrier>(&self, queue: &mut VirtQueue<B>) {
        assert_eq!(queue.negotiate(u32::from(self.size)).unwrap(), self.size);
        queue.set_desc_table(self.desc_table());
        queue.set_avail_ring(self.avail_ring());
        queue.set_used_ring(self.used_ring());
        queue.activate(&self.mem).unwrap();
    }

    pub fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = Descriptor {
            addr,
            len,
            flags,
            next,
        };
        self.mem
            .write(self.desc_table() + u64::from(index) * 16, &desc.to_bytes())
            .unwrap();
    }

    /// Put `head` in the next available slot and publish it.
    pub fn publish(&mut self, head: u16) {
        let slot = self.avail_ring() + 4 + 2 * u64::from(self.avail_idx % self.size);
        self.mem.store_u16(slot, head).unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.mem
            .store_release_u16(&self.barrier, self.avail_ring() + 2, self.avail_idx)
            .unwrap();
    }

    /// Number of entries published so far (wrapping).
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Write the available index directly, bypassing the slot bookkeeping.
    pub fn set_avail_idx(&self, idx: u16) {
        self.mem.store_u16(self.avail_ring() + 2, idx).unwrap();
    }

    pub fn set_no_interrupt(&self, on: bool) {
        self.mem.store_u16(self.avail_ring(), u16::from(on)).unwrap();
    }

    pub fn set_used_event(&self, idx: u16) {
        let addr = self.avail_ring() + 4 + 2 * u64::from(self.size);
        self.mem.store_u16(addr, idx).unwrap();
    }

    pub fn used_flags(&self) -> u16 {
        self.mem.load_u16(self.used_ring()).unwrap()
    }

    pub fn used_idx(&self) -> u16 {
        self.mem
            .load_acquire_u16(&self.barrier, self.used_ring() + 2)
            .unwrap()
    }

    /// `(id, len)` of used ring element `position`.
    pub fn used_elem(&self, position: u16) -> (u32, u32) {
        let addr = self.used_ring() + 4 + 8 * u64::from(position % self.size);
        (
            self.mem.read_u32(addr).unwrap(),
            self.mem.read_u32(addr + 4).unwrap(),
        )
    }

    pub fn avail_event(&self) -> u16 {
        let addr = self.used_ring() + 4 + 8 * u64::from(self.size);
        self.mem.load_u16(addr).unwrap()
    }
}

/// Something [`RecordingSink`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    Vector { vcpu: u32, vector: u8 },
    Nmi { vcpu: u32 },
    Wake { vcpu: u32 },
}

/// Interrupt sink that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Injected>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Injected> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Injections only, wakes filtered out.
    pub fn injections(&self) -> Vec<Injected> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Injected::Wake { .. }))
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: Injected) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl InterruptSink for RecordingSink {
    fn inject(&self, vcpu: u32, vector: u8) {
        self.push(Injected::Vector { vcpu, vector });
    }

    fn inject_nmi(&self, vcpu: u32) {
        self.push(Injected::Nmi { vcpu });
    }

    fn wake(&self, vcpu: u32) {
        self.push(Injected::Wake { vcpu });
    }
}

/// Writer that appends to a shared buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(pub Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::io::Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
