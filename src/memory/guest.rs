//! Guest memory region abstraction.

/// What backs a region of guest physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Ordinary guest RAM, readable and writable by devices.
    Ram,
    /// Backed, but devices may only read from it.
    ReadOnly,
    /// Declared in the address map but not backed by host memory
    /// (MMIO windows, holes).
    Hole,
}

/// Represents a region of guest physical memory.
#[derive(Debug, Clone)]
pub struct GuestMemoryRegion {
    /// Guest physical address
    pub guest_addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Backing kind
    pub kind: RegionKind,
}

impl GuestMemoryRegion {
    /// Create a new RAM region.
    pub fn new(guest_addr: u64, size: u64) -> Self {
        Self {
            guest_addr,
            size,
            kind: RegionKind::Ram,
        }
    }

    /// Create a read-only memory region.
    pub fn readonly(guest_addr: u64, size: u64) -> Self {
        Self {
            guest_addr,
            size,
            kind: RegionKind::ReadOnly,
        }
    }

    /// Create an unbacked hole.
    pub fn hole(guest_addr: u64, size: u64) -> Self {
        Self {
            guest_addr,
            size,
            kind: RegionKind::Hole,
        }
    }

    /// First address past the end of this region, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.guest_addr.checked_add(self.size)
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr - self.guest_addr < self.size
    }

    /// Check if `[addr, addr + len)` lies completely inside this region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        self.contains(addr) && len <= self.size - (addr - self.guest_addr)
    }

    /// Check whether two regions share any address.
    pub fn overlaps(&self, other: &GuestMemoryRegion) -> bool {
        self.contains(other.guest_addr) || other.contains(self.guest_addr)
    }

    /// Get the offset of an address within this region.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_addr)
        } else {
            None
        }
    }
}
