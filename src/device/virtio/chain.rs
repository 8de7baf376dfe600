//! Descriptor chains.
//!
//! The descriptor table is an arena and every index the guest hands us is an
//! untrusted key into it. A chain is walked completely, with cycle and length
//! checks, before any of it is returned to a backend, so a malformed chain is
//! rejected as a whole instead of being half-processed.

use crate::error::{ChainFault, Error, Result};
use crate::memory::GuestMemory;

/// Size of one descriptor table entry in bytes.
pub const DESCRIPTOR_SIZE: u64 = 16;

/// Virtqueue descriptor flags.
pub mod desc_flags {
    /// This marks a buffer as continuing via the next field.
    pub const NEXT: u16 = 1;
    /// This marks a buffer as device write-only (vs read-only).
    pub const WRITE: u16 = 2;
    /// This means the buffer contains a list of buffer descriptors.
    pub const INDIRECT: u16 = 4;
}

/// A single virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

impl Descriptor {
    /// Decode a descriptor from its 16-byte little-endian table entry.
    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_le_bytes([raw[12], raw[13]]),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }

    /// Encode into the 16-byte table entry format.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&self.addr.to_le_bytes());
        raw[8..12].copy_from_slice(&self.len.to_le_bytes());
        raw[12..14].copy_from_slice(&self.flags.to_le_bytes());
        raw[14..16].copy_from_slice(&self.next.to_le_bytes());
        raw
    }

    /// Read a descriptor from guest memory.
    pub fn read_from(mem: &GuestMemory, addr: u64) -> Result<Self> {
        let mut raw = [0u8; 16];
        mem.read(addr, &mut raw)?;
        Ok(Self::from_bytes(&raw))
    }

    /// Check if this descriptor has the NEXT flag set.
    pub fn has_next(&self) -> bool {
        self.flags & desc_flags::NEXT != 0
    }

    /// Check if this descriptor is device write-only.
    pub fn is_write_only(&self) -> bool {
        self.flags & desc_flags::WRITE != 0
    }

    /// Check if this descriptor points at an indirect table.
    pub fn is_indirect(&self) -> bool {
        self.flags & desc_flags::INDIRECT != 0
    }
}

/// A fully validated descriptor chain, in link order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    head: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Index of the head descriptor; this is what gets completed.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Number of buffers in the chain (indirect tables expanded).
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the chain has no buffers.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// All buffers in link order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Iterate over the buffers.
    pub fn iter(&self) -> std::slice::Iter<'_, Descriptor> {
        self.descriptors.iter()
    }

    /// Buffers the device may only read.
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| !d.is_write_only())
    }

    /// Buffers the device may write.
    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_write_only())
    }

    /// Total capacity of the device-writable buffers.
    pub fn writable_len(&self) -> u64 {
        self.writable().map(|d| u64::from(d.len)).sum()
    }
}

impl<'a> IntoIterator for &'a DescriptorChain {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// Walks chains of one descriptor table.
pub(crate) struct ChainWalker<'m> {
    pub(crate) mem: &'m GuestMemory,
    pub(crate) desc_table: u64,
    pub(crate) queue_size: u16,
    pub(crate) indirect: bool,
}

impl<'m> ChainWalker<'m> {
    pub(crate) fn walk(&self, head: u16) -> Result<DescriptorChain> {
        let fault = |fault| Error::MalformedChain { head, fault };
        let size = usize::from(self.queue_size);

        if head >= self.queue_size {
            return Err(fault(ChainFault::IndexOutOfRange(head)));
        }

        let mut visited = vec![false; size];
        let mut descriptors = Vec::new();
        let mut index = head;

        loop {
            if std::mem::replace(&mut visited[usize::from(index)], true) {
                return Err(fault(ChainFault::Cycle));
            }
            let addr = self.desc_table + u64::from(index) * DESCRIPTOR_SIZE;
            let desc = Descriptor::read_from(self.mem, addr)?;

            if desc.is_indirect() {
                if !self.indirect {
                    return Err(fault(ChainFault::UnexpectedIndirect));
                }
                if desc.has_next() {
                    return Err(fault(ChainFault::NestedIndirect));
                }
                self.walk_indirect(head, &desc, &mut descriptors)?;
                break;
            }

            descriptors.push(desc);
            if descriptors.len() > size {
                return Err(fault(ChainFault::TooLong));
            }
            if !desc.has_next() {
                break;
            }
            if desc.next >= self.queue_size {
                return Err(fault(ChainFault::IndexOutOfRange(desc.next)));
            }
            index = desc.next;
        }

        Ok(DescriptorChain { head, descriptors })
    }

    fn walk_indirect(
        &self,
        head: u16,
        table: &Descriptor,
        descriptors: &mut Vec<Descriptor>,
    ) -> Result<()> {
        let fault = |fault| Error::MalformedChain { head, fault };
        let size = usize::from(self.queue_size);

        if table.len == 0 || u64::from(table.len) % DESCRIPTOR_SIZE != 0 {
            return Err(fault(ChainFault::InvalidIndirectTable(table.len)));
        }
        let count = (u64::from(table.len) / DESCRIPTOR_SIZE) as usize;
        if count > size {
            return Err(fault(ChainFault::InvalidIndirectTable(table.len)));
        }

        let mut visited = vec![false; count];
        let mut index = 0usize;
        loop {
            if std::mem::replace(&mut visited[index], true) {
                return Err(fault(ChainFault::Cycle));
            }
            let addr = table.addr + index as u64 * DESCRIPTOR_SIZE;
            let desc = Descriptor::read_from(self.mem, addr)?;
            if desc.is_indirect() {
                return Err(fault(ChainFault::NestedIndirect));
            }

            descriptors.push(desc);
            if descriptors.len() > size {
                return Err(fault(ChainFault::TooLong));
            }
            if !desc.has_next() {
                return Ok(());
            }
            if usize::from(desc.next) >= count {
                return Err(fault(ChainFault::IndexOutOfRange(desc.next)));
            }
            index = usize::from(desc.next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desc_flags::{INDIRECT, NEXT, WRITE};

    const TABLE: u64 = 0x1000;

    fn mem() -> GuestMemory {
        GuestMemory::with_ram(0x1000, 0x4000).unwrap()
    }

    fn put(mem: &GuestMemory, base: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = Descriptor { addr, len, flags, next };
        mem.write(base + u64::from(index) * DESCRIPTOR_SIZE, &desc.to_bytes())
            .unwrap();
    }

    fn walker(mem: &GuestMemory, indirect: bool) -> ChainWalker<'_> {
        ChainWalker {
            mem,
            desc_table: TABLE,
            queue_size: 8,
            indirect,
        }
    }

    #[test]
    fn test_descriptor_encoding() {
        let desc = Descriptor {
            addr: 0x1122_3344_5566_7788,
            len: 0x100,
            flags: NEXT | WRITE,
            next: 5,
        };
        assert_eq!(Descriptor::from_bytes(&desc.to_bytes()), desc);
        assert!(desc.has_next() && desc.is_write_only() && !desc.is_indirect());
    }

    #[test]
    fn test_walk_linked_chain() {
        let mem = mem();
        put(&mem, TABLE, 3, 0x3000, 64, NEXT, 6);
        put(&mem, TABLE, 6, 0x3100, 128, WRITE, 0);

        let chain = walker(&mem, false).walk(3).unwrap();
        assert_eq!(chain.head(), 3);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.descriptors()[0].len, 64);
        assert_eq!(chain.readable().count(), 1);
        assert_eq!(chain.writable_len(), 128);
    }

    #[test]
    fn test_cycle_rejected() {
        let mem = mem();
        put(&mem, TABLE, 0, 0x3000, 8, NEXT, 1);
        put(&mem, TABLE, 1, 0x3000, 8, NEXT, 2);
        put(&mem, TABLE, 2, 0x3000, 8, NEXT, 0);

        let err = walker(&mem, false).walk(0).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedChain { head: 0, fault: ChainFault::Cycle }
        ));
    }

    #[test]
    fn test_self_loop_rejected() {
        let mem = mem();
        put(&mem, TABLE, 4, 0x3000, 8, NEXT, 4);
        assert!(matches!(
            walker(&mem, false).walk(4),
            Err(Error::MalformedChain { fault: ChainFault::Cycle, .. })
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let mem = mem();
        put(&mem, TABLE, 0, 0x3000, 8, NEXT, 200);
        assert!(matches!(
            walker(&mem, false).walk(0),
            Err(Error::MalformedChain { fault: ChainFault::IndexOutOfRange(200), .. })
        ));
        assert!(matches!(
            walker(&mem, false).walk(8),
            Err(Error::MalformedChain { head: 8, fault: ChainFault::IndexOutOfRange(8) })
        ));
    }

    #[test]
    fn test_indirect_table() {
        let mem = mem();
        let table = 0x2000;
        put(&mem, table, 0, 0x3000, 16, NEXT, 2);
        put(&mem, table, 2, 0x3100, 32, WRITE | NEXT, 1);
        put(&mem, table, 1, 0x3200, 48, WRITE, 0);
        put(&mem, TABLE, 0, table, 3 * 16, INDIRECT, 0);

        let chain = walker(&mem, true).walk(0).unwrap();
        let lens: Vec<u32> = chain.iter().map(|d| d.len).collect();
        assert_eq!(lens, vec![16, 32, 48]);

        assert!(matches!(
            walker(&mem, false).walk(0),
            Err(Error::MalformedChain { fault: ChainFault::UnexpectedIndirect, .. })
        ));
    }

    #[test]
    fn test_indirect_faults() {
        let mem = mem();
        put(&mem, TABLE, 0, 0x2000, 20, INDIRECT, 0);
        assert!(matches!(
            walker(&mem, true).walk(0),
            Err(Error::MalformedChain { fault: ChainFault::InvalidIndirectTable(20), .. })
        ));

        put(&mem, TABLE, 1, 0x2000, 16, INDIRECT | NEXT, 2);
        assert!(matches!(
            walker(&mem, true).walk(1),
            Err(Error::MalformedChain { fault: ChainFault::NestedIndirect, .. })
        ));

        put(&mem, 0x2100, 0, 0x2000, 16, INDIRECT, 0);
        put(&mem, TABLE, 2, 0x2100, 16, INDIRECT, 0);
        assert!(matches!(
            walker(&mem, true).walk(2),
            Err(Error::MalformedChain { fault: ChainFault::NestedIndirect, .. })
        ));

        // A table larger than the queue would exceed the chain length limit.
        put(&mem, TABLE, 3, 0x2000, 16 * 9, INDIRECT, 0);
        assert!(matches!(
            walker(&mem, true).walk(3),
            Err(Error::MalformedChain { fault: ChainFault::InvalidIndirectTable(_), .. })
        ));
    }

    #[test]
    fn test_descriptor_outside_memory() {
        let mem = mem();
        let walker = ChainWalker {
            mem: &mem,
            desc_table: 0x4FF8,
            queue_size: 8,
            indirect: false,
        };
        assert!(matches!(walker.walk(0), Err(Error::OutOfRange { .. })));
    }
}
