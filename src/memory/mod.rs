//! Guest physical memory as seen by device backends.
//!
//! Every guest physical address that reaches the host through a ring is
//! untrusted. [`GuestMemory`] resolves `(address, length, direction)` to a
//! bounded [`GuestSlice`] or fails with `OutOfRange` (outside every region,
//! or straddling two), `Unmapped` (inside a declared hole) or `ReadOnly`
//! (device write into a read-only region).
//!
//! Translations are never cached: callers resolve addresses again for every
//! ring entry, and the layout itself can be swapped through
//! [`GuestMemoryCell`] between traversals.

mod guest;
mod mapping;

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock};

pub use guest::{GuestMemoryRegion, RegionKind};

use crate::arch::{self, Barrier};
use crate::error::{Error, Result};
use mapping::HostMapping;

/// Standard guest physical layout used by the builder defaults.
pub mod layout {
    /// RAM base address - guest physical addresses of RAM start here.
    pub const RAM_BASE: u64 = 0x4000_0000;

    /// Default RAM size (16 MiB).
    pub const DEFAULT_RAM_SIZE: u64 = 16 << 20;

    /// Start of the virtio-mmio device window.
    pub const MMIO_BASE: u64 = 0x0A00_0000;

    /// Stride between consecutive virtio-mmio devices.
    pub const MMIO_STRIDE: u64 = 0x200;
}

/// Direction of a device access to guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The device reads (guest-to-device buffer).
    Read,
    /// The device writes (device-writable buffer).
    Write,
}

struct Region {
    desc: GuestMemoryRegion,
    backing: Option<HostMapping>,
}

/// Guest physical address space: a sorted set of non-overlapping regions.
#[derive(Default)]
pub struct GuestMemory {
    regions: Vec<Region>,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.regions.iter().map(|r| &r.desc))
            .finish()
    }
}

impl GuestMemory {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an address space with a single RAM region.
    pub fn with_ram(guest_addr: u64, size: u64) -> Result<Self> {
        let mut mem = Self::new();
        mem.add_region(GuestMemoryRegion::new(guest_addr, size))?;
        Ok(mem)
    }

    /// Add a region. RAM and read-only regions get zeroed host backing.
    pub fn add_region(&mut self, desc: GuestMemoryRegion) -> Result<()> {
        if desc.size == 0 || desc.guest_addr.checked_add(desc.size - 1).is_none() {
            return Err(Error::MemoryLayout(format!(
                "region at 0x{:x} with size 0x{:x} is empty or wraps",
                desc.guest_addr, desc.size
            )));
        }
        if let Some(existing) = self.regions.iter().find(|r| r.desc.overlaps(&desc)) {
            return Err(Error::MemoryLayout(format!(
                "region at 0x{:x} overlaps region at 0x{:x}",
                desc.guest_addr, existing.desc.guest_addr
            )));
        }

        // Ring fields are accessed as atomics at guest-aligned addresses,
        // which only works if the backing offset has the same alignment.
        if desc.kind != RegionKind::Hole && desc.guest_addr % 8 != 0 {
            return Err(Error::MemoryLayout(format!(
                "backed region at 0x{:x} is not 8-byte aligned",
                desc.guest_addr
            )));
        }

        let backing = match desc.kind {
            RegionKind::Hole => None,
            RegionKind::Ram | RegionKind::ReadOnly => {
                let size = usize::try_from(desc.size).map_err(|_| {
                    Error::MemoryAllocationFailed(format!("size 0x{:x} too large", desc.size))
                })?;
                Some(HostMapping::new(size)?)
            }
        };

        let pos = self
            .regions
            .partition_point(|r| r.desc.guest_addr < desc.guest_addr);
        self.regions.insert(pos, Region { desc, backing });
        Ok(())
    }

    /// Add a read-only region initialised with `contents`.
    pub fn add_readonly(&mut self, guest_addr: u64, contents: &[u8]) -> Result<()> {
        let region = GuestMemoryRegion::readonly(guest_addr, contents.len() as u64);
        self.add_region(region)?;
        let region = self.find(guest_addr, contents.len() as u64)?;
        if let Some(backing) = &region.backing {
            backing.write(0, contents);
        }
        Ok(())
    }

    /// All regions, in address order.
    pub fn regions(&self) -> impl Iterator<Item = &GuestMemoryRegion> {
        self.regions.iter().map(|r| &r.desc)
    }

    /// Total bytes of backed memory.
    pub fn backed_size(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.backing.is_some())
            .map(|r| r.desc.size)
            .sum()
    }

    fn find(&self, addr: u64, len: u64) -> Result<&Region> {
        let pos = self.regions.partition_point(|r| r.desc.guest_addr <= addr);
        let region = pos
            .checked_sub(1)
            .and_then(|i| self.regions.get(i))
            .filter(|r| r.desc.contains_range(addr, len.max(1)))
            .ok_or(Error::OutOfRange { addr, len })?;
        Ok(region)
    }

    /// Resolve a guest range for access in the given direction.
    pub fn translate(&self, addr: u64, len: u64, access: Access) -> Result<GuestSlice<'_>> {
        let region = self.find(addr, len)?;
        let backing = region.backing.as_ref().ok_or(Error::Unmapped(addr))?;
        if access == Access::Write && region.desc.kind == RegionKind::ReadOnly {
            return Err(Error::ReadOnly(addr));
        }
        let offset = (addr - region.desc.guest_addr) as usize;
        Ok(GuestSlice {
            backing,
            offset,
            len: len as usize,
            addr,
            access,
            _marker: PhantomData,
        })
    }

    /// Check that a range is backed and accessible in the given direction.
    pub fn check_range(&self, addr: u64, len: u64, access: Access) -> Result<()> {
        self.translate(addr, len, access).map(|_| ())
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.translate(addr, buf.len() as u64, Access::Read)?
            .read_at(0, buf)
    }

    /// Write bytes to a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.translate(addr, data.len() as u64, Access::Write)?
            .write_at(0, data)
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn ring_field(&self, addr: u64, access: Access) -> Result<GuestSlice<'_>> {
        if addr % 2 != 0 {
            return Err(Error::Misaligned { addr, align: 2 });
        }
        self.translate(addr, 2, access)
    }

    /// Load a 16-bit ring field without ordering.
    pub fn load_u16(&self, addr: u64) -> Result<u16> {
        let slice = self.ring_field(addr, Access::Read)?;
        Ok(u16::from_le(
            slice.backing.atomic_u16(slice.offset).load(Ordering::Relaxed),
        ))
    }

    /// Store a 16-bit ring field without ordering.
    pub fn store_u16(&self, addr: u64, value: u16) -> Result<()> {
        let slice = self.ring_field(addr, Access::Write)?;
        slice
            .backing
            .atomic_u16(slice.offset)
            .store(value.to_le(), Ordering::Relaxed);
        Ok(())
    }

    /// Load a 16-bit publish index with acquire semantics.
    pub fn load_acquire_u16<B: Barrier>(&self, barrier: &B, addr: u64) -> Result<u16> {
        let slice = self.ring_field(addr, Access::Read)?;
        let raw = arch::load_acquire(barrier, slice.backing.atomic_u16(slice.offset));
        Ok(u16::from_le(raw))
    }

    /// Store a 16-bit publish index with release semantics.
    pub fn store_release_u16<B: Barrier>(&self, barrier: &B, addr: u64, value: u16) -> Result<()> {
        let slice = self.ring_field(addr, Access::Write)?;
        arch::store_release(barrier, slice.backing.atomic_u16(slice.offset), value.to_le());
        Ok(())
    }

    /// Store a naturally aligned `u32` atomically (used ring elements).
    pub fn store_u32(&self, addr: u64, value: u32) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Misaligned { addr, align: 4 });
        }
        let slice = self.translate(addr, 4, Access::Write)?;
        slice
            .backing
            .atomic_u32(slice.offset)
            .store(value.to_le(), Ordering::Relaxed);
        Ok(())
    }
}

/// A bounds-checked window into guest memory.
///
/// Borrowed from a [`GuestMemory`] for the duration of one transaction.
pub struct GuestSlice<'a> {
    backing: &'a HostMapping,
    offset: usize,
    len: usize,
    addr: u64,
    access: Access,
    _marker: PhantomData<&'a GuestMemory>,
}

impl<'a> GuestSlice<'a> {
    /// Guest physical address of the first byte.
    pub fn guest_addr(&self) -> u64 {
        self.addr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Direction the slice was translated for.
    pub fn access(&self) -> Access {
        self.access
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfRange {
                addr: self.addr.wrapping_add(offset as u64),
                len: len as u64,
            }),
        }
    }

    /// Copy bytes out of the slice.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.backing.read(self.offset + offset, buf);
        Ok(())
    }

    /// Copy bytes into the slice. Only allowed for [`Access::Write`] slices.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.access != Access::Write {
            return Err(Error::ReadOnly(self.addr.wrapping_add(offset as u64)));
        }
        self.check(offset, data.len())?;
        self.backing.write(self.offset + offset, data);
        Ok(())
    }

    /// Fill the whole slice with a byte value.
    pub fn fill(&self, value: u8) -> Result<()> {
        if self.access != Access::Write {
            return Err(Error::ReadOnly(self.addr));
        }
        self.backing.fill(self.offset, self.len, value);
        Ok(())
    }

    /// Copy the whole slice into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.backing.read(self.offset, &mut out);
        out
    }
}

/// Swappable handle to the current guest memory layout.
///
/// Consumers take a snapshot with [`GuestMemoryCell::current`] at the start of
/// each traversal; the owner installs a new layout with
/// [`GuestMemoryCell::replace`].
#[derive(Debug)]
pub struct GuestMemoryCell {
    inner: RwLock<Arc<GuestMemory>>,
}

impl GuestMemoryCell {
    /// Wrap an initial layout.
    pub fn new(memory: GuestMemory) -> Self {
        Self {
            inner: RwLock::new(Arc::new(memory)),
        }
    }

    /// Snapshot of the current layout.
    pub fn current(&self) -> Arc<GuestMemory> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new layout, returning the previous one.
    pub fn replace(&self, memory: GuestMemory) -> Arc<GuestMemory> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(memory))
    }
}
